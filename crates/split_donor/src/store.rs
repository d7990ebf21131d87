//! Durable storage for split operation documents.
//!
//! Values are framed as `[u32 crc32][json payload]` so a torn or corrupted
//! record is detected on load instead of being decoded into a plausible but
//! wrong document.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crc32fast::Hasher;
use fjall::{Keyspace, PartitionCreateOptions, PersistMode};
use parking_lot::{Mutex, RwLock};

use crate::document::{OperationId, SplitDocument, SplitState};
use crate::error::{DonorError, DonorResult};

/// Partition holding one record per split operation.
pub const DONOR_PARTITION: &str = "shard_split_donors";

/// One persisted record as read back from storage. Records that fail to
/// decode are surfaced to the caller rather than skipped.
#[derive(Debug)]
pub struct StoredRecord {
    /// Raw storage key, kept for diagnostics when the body is unreadable.
    pub key: String,
    pub document: DonorResult<SplitDocument>,
}

/// Atomic durable-document store consumed by the donor.
///
/// A successful write must be visible to `list` after any subsequent restart,
/// and concurrent writers to the same record must be serialized.
pub trait DocumentStore: Send + Sync + 'static {
    /// Create a record. Fails if the id already exists.
    fn insert(&self, doc: &SplitDocument) -> DonorResult<()>;
    /// Replace a record only if its persisted state equals `expected`.
    fn update_if_state(&self, doc: &SplitDocument, expected: SplitState) -> DonorResult<()>;
    fn remove(&self, id: OperationId) -> DonorResult<()>;
    fn get(&self, id: OperationId) -> DonorResult<Option<SplitDocument>>;
    fn list(&self) -> DonorResult<Vec<StoredRecord>>;
}

/// Fjall-backed store; every write is synced before returning.
///
/// A write whose sync fails is rolled back in the partition, so readers and
/// later compare-and-set calls never see a record that was not made durable.
pub struct FjallDocumentStore {
    keyspace: Arc<Keyspace>,
    docs: fjall::PartitionHandle,
    write_lock: Mutex<()>,
    #[cfg(test)]
    fail_next_sync: AtomicBool,
}

impl FjallDocumentStore {
    pub fn open(keyspace: Arc<Keyspace>) -> anyhow::Result<Self> {
        let docs = keyspace.open_partition(DONOR_PARTITION, PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            docs,
            write_lock: Mutex::new(()),
            #[cfg(test)]
            fail_next_sync: AtomicBool::new(false),
        })
    }

    /// Open (or create) a keyspace rooted at `dir` and the donor partition in it.
    pub fn open_dir(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = Arc::new(fjall::Config::new(dir.as_ref()).open()?);
        Self::open(keyspace)
    }

    /// Make the next sync fail after its write was applied to the partition.
    #[cfg(test)]
    pub(crate) fn fail_next_sync(&self) {
        self.fail_next_sync.store(true, Ordering::SeqCst);
    }

    fn read_raw(&self, key: &str) -> DonorResult<Option<Vec<u8>>> {
        let bytes = self
            .docs
            .get(key.as_bytes())
            .map_err(DonorError::persistence)?;
        Ok(bytes.map(|raw| raw.to_vec()))
    }

    fn read(&self, id: OperationId) -> DonorResult<Option<SplitDocument>> {
        let key = id.to_string();
        self.read_raw(&key)?
            .map(|raw| decode_record(&key, &raw))
            .transpose()
    }

    /// Apply `doc` over `prior` (the raw value currently stored), then sync.
    fn write(&self, doc: &SplitDocument, prior: Option<Vec<u8>>) -> DonorResult<()> {
        let key = doc.id.to_string();
        let payload = encode_record(doc)?;
        self.docs
            .insert(key.as_bytes(), payload)
            .map_err(DonorError::persistence)?;
        self.sync_or_roll_back(&key, prior)
    }

    fn sync_or_roll_back(&self, key: &str, prior: Option<Vec<u8>>) -> DonorResult<()> {
        let Err(err) = self.sync() else {
            return Ok(());
        };
        let restored = match prior {
            Some(raw) => self.docs.insert(key.as_bytes(), raw),
            None => self.docs.remove(key.as_bytes()),
        };
        if let Err(restore_err) = restored {
            tracing::error!(
                key,
                error = %restore_err,
                "failed to roll back unsynced split record"
            );
        }
        Err(err)
    }

    fn sync(&self) -> DonorResult<()> {
        #[cfg(test)]
        if self.fail_next_sync.swap(false, Ordering::SeqCst) {
            return Err(DonorError::PersistenceFailure(
                "injected sync failure".to_string(),
            ));
        }
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(DonorError::persistence)
    }
}

impl DocumentStore for FjallDocumentStore {
    fn insert(&self, doc: &SplitDocument) -> DonorResult<()> {
        let _guard = self.write_lock.lock();
        if self.read(doc.id)?.is_some() {
            return Err(DonorError::PersistenceFailure(format!(
                "operation {} already exists",
                doc.id
            )));
        }
        self.write(doc, None)
    }

    fn update_if_state(&self, doc: &SplitDocument, expected: SplitState) -> DonorResult<()> {
        let _guard = self.write_lock.lock();
        let key = doc.id.to_string();
        let prior = self.read_raw(&key)?;
        let current = prior
            .as_deref()
            .map(|raw| decode_record(&key, raw))
            .transpose()?;
        check_expected_state(doc.id, current, expected)?;
        self.write(doc, prior)
    }

    fn remove(&self, id: OperationId) -> DonorResult<()> {
        let _guard = self.write_lock.lock();
        let key = id.to_string();
        let prior = self.read_raw(&key)?;
        self.docs
            .remove(key.as_bytes())
            .map_err(DonorError::persistence)?;
        self.sync_or_roll_back(&key, prior)
    }

    fn get(&self, id: OperationId) -> DonorResult<Option<SplitDocument>> {
        self.read(id)
    }

    fn list(&self) -> DonorResult<Vec<StoredRecord>> {
        let mut out = Vec::new();
        for item in self.docs.iter() {
            let (key, value) = item.map_err(DonorError::persistence)?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let document = decode_record(&key, &value);
            out.push(StoredRecord { key, document });
        }
        Ok(out)
    }
}

/// In-memory store used by tests. Clones share the same records, so a
/// "restart" is modelled by recovering a new service from a clone.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    records: Arc<RwLock<BTreeMap<OperationId, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `PersistenceFailure`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Overwrite a raw record, bypassing validation.
    pub fn put_raw(&self, id: OperationId, bytes: Vec<u8>) {
        self.records.write().insert(id, bytes);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn check_writable(&self) -> DonorResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DonorError::PersistenceFailure(
                "injected write failure".to_string(),
            ));
        }
        Ok(())
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn insert(&self, doc: &SplitDocument) -> DonorResult<()> {
        self.check_writable()?;
        let payload = encode_record(doc)?;
        let mut records = self.records.write();
        if records.contains_key(&doc.id) {
            return Err(DonorError::PersistenceFailure(format!(
                "operation {} already exists",
                doc.id
            )));
        }
        records.insert(doc.id, payload);
        Ok(())
    }

    fn update_if_state(&self, doc: &SplitDocument, expected: SplitState) -> DonorResult<()> {
        self.check_writable()?;
        let payload = encode_record(doc)?;
        let mut records = self.records.write();
        let current = records
            .get(&doc.id)
            .map(|raw| decode_record(&doc.id.to_string(), raw))
            .transpose()?;
        check_expected_state(doc.id, current, expected)?;
        records.insert(doc.id, payload);
        Ok(())
    }

    fn remove(&self, id: OperationId) -> DonorResult<()> {
        self.check_writable()?;
        self.records.write().remove(&id);
        Ok(())
    }

    fn get(&self, id: OperationId) -> DonorResult<Option<SplitDocument>> {
        let records = self.records.read();
        records
            .get(&id)
            .map(|raw| decode_record(&id.to_string(), raw))
            .transpose()
    }

    fn list(&self) -> DonorResult<Vec<StoredRecord>> {
        let records = self.records.read();
        Ok(records
            .iter()
            .map(|(id, raw)| {
                let key = id.to_string();
                let document = decode_record(&key, raw);
                StoredRecord { key, document }
            })
            .collect())
    }
}

fn check_expected_state(
    id: OperationId,
    current: Option<SplitDocument>,
    expected: SplitState,
) -> DonorResult<()> {
    let Some(current) = current else {
        return Err(DonorError::PersistenceFailure(format!(
            "operation {id} is missing from the store"
        )));
    };
    if current.state != expected {
        return Err(DonorError::PersistenceFailure(format!(
            "operation {id} persisted state is {} (expected {expected})",
            current.state
        )));
    }
    Ok(())
}

/// Encode a document as `[u32 crc32][json]`.
pub fn encode_record(doc: &SplitDocument) -> DonorResult<Vec<u8>> {
    let payload = serde_json::to_vec(doc).map_err(DonorError::persistence)?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let checksum = hasher.finalize();
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&checksum.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode and verify a framed record.
pub fn decode_record(key: &str, raw: &[u8]) -> DonorResult<SplitDocument> {
    if raw.len() < 4 {
        return Err(DonorError::integrity(
            format!("record {key}"),
            "record shorter than checksum header",
        ));
    }
    let (crc_buf, payload) = raw.split_at(4);
    let expected = u32::from_be_bytes([crc_buf[0], crc_buf[1], crc_buf[2], crc_buf[3]]);
    let mut hasher = Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != expected {
        return Err(DonorError::integrity(
            format!("record {key}"),
            "checksum mismatch",
        ));
    }
    let doc: SplitDocument = serde_json::from_slice(payload)
        .map_err(|err| DonorError::integrity(format!("record {key}"), err.to_string()))?;
    if doc.id.to_string() != key {
        return Err(DonorError::integrity(
            format!("record {key}"),
            format!("stored under key {key} but carries id {}", doc.id),
        ));
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_tenant_set;
    use crate::op_time::OpTime;

    fn doc() -> SplitDocument {
        let mut doc = SplitDocument::new(
            parse_tenant_set(&["t1", "t2"]).expect("tenants"),
            Some("recipientSet".to_string()),
            1,
        );
        doc.state = SplitState::Splitting;
        doc
    }

    fn exercise_store(store: &dyn DocumentStore) {
        let mut d = doc();
        store.insert(&d).expect("insert");
        assert!(store.insert(&d).is_err(), "duplicate insert must fail");

        let mut blocking = d.clone();
        blocking.state = SplitState::Blocking;
        blocking.block_op_time = Some(OpTime::new(1, 10));
        store
            .update_if_state(&blocking, SplitState::Splitting)
            .expect("cas from splitting");

        // A second writer that still believes the record is splitting loses.
        d.state = SplitState::Aborted;
        let err = store
            .update_if_state(&d, SplitState::Splitting)
            .expect_err("stale cas must fail");
        assert_eq!(err.code(), "PERSISTENCEFAILURE");

        assert_eq!(store.get(blocking.id).expect("get"), Some(blocking.clone()));
        let listed = store.list().expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, blocking.id.to_string());
        assert_eq!(listed[0].document.as_ref().ok(), Some(&blocking));

        store.remove(blocking.id).expect("remove");
        assert_eq!(store.get(blocking.id).expect("get"), None);
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn memory_store_cas_semantics() {
        exercise_store(&MemoryDocumentStore::new());
    }

    #[test]
    fn fjall_store_cas_semantics() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FjallDocumentStore::open_dir(dir.path()).expect("open store");
        exercise_store(&store);
    }

    #[test]
    fn fjall_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let d = doc();
        {
            let store = FjallDocumentStore::open_dir(dir.path()).expect("open store");
            store.insert(&d).expect("insert");
        }
        let store = FjallDocumentStore::open_dir(dir.path()).expect("reopen store");
        assert_eq!(store.get(d.id).expect("get"), Some(d));
    }

    #[test]
    fn fjall_unsynced_writes_are_rolled_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FjallDocumentStore::open_dir(dir.path()).expect("open store");
        let d = doc();

        store.fail_next_sync();
        let err = store.insert(&d).expect_err("sync failure");
        assert_eq!(err.code(), "PERSISTENCEFAILURE");
        assert_eq!(store.get(d.id).expect("get"), None);
        assert!(store.list().expect("list").is_empty());
        store.insert(&d).expect("retried insert");

        let mut blocking = d.clone();
        blocking.state = SplitState::Blocking;
        blocking.block_op_time = Some(OpTime::new(1, 10));
        store.fail_next_sync();
        store
            .update_if_state(&blocking, SplitState::Splitting)
            .expect_err("sync failure");
        assert_eq!(store.get(d.id).expect("get"), Some(d.clone()));
        store
            .update_if_state(&blocking, SplitState::Splitting)
            .expect("retried cas still sees splitting");

        store.fail_next_sync();
        store.remove(d.id).expect_err("sync failure");
        assert_eq!(store.get(d.id).expect("get"), Some(blocking.clone()));
        drop(store);

        let store = FjallDocumentStore::open_dir(dir.path()).expect("reopen store");
        assert_eq!(store.get(d.id).expect("get"), Some(blocking));
    }

    #[test]
    fn corrupted_record_is_reported_not_skipped() {
        let store = MemoryDocumentStore::new();
        let d = doc();
        let mut raw = encode_record(&d).expect("encode");
        let last = raw.len() - 2;
        raw[last] ^= 0xff;
        store.put_raw(d.id, raw);

        let listed = store.list().expect("list");
        assert_eq!(listed.len(), 1);
        let err = listed[0].document.as_ref().expect_err("corrupt record");
        assert_eq!(err.code(), "INTEGRITYVIOLATION");
        assert!(err.to_string().contains("checksum"), "unexpected: {err}");
    }

    #[test]
    fn injected_failures_leave_records_untouched() {
        let store = MemoryDocumentStore::new();
        let d = doc();
        store.insert(&d).expect("insert");
        store.set_fail_writes(true);
        let mut next = d.clone();
        next.state = SplitState::Blocking;
        next.block_op_time = Some(OpTime::new(1, 1));
        assert!(store.update_if_state(&next, SplitState::Splitting).is_err());
        assert!(store.remove(d.id).is_err());
        store.set_fail_writes(false);
        assert_eq!(store.get(d.id).expect("get"), Some(d));
    }
}
