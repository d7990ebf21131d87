//! Shared helpers for process-level integration tests.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Timeout for node startup.
pub const IO_TIMEOUT: Duration = Duration::from_secs(20);
/// Read/write timeout on admin connections.
pub const RESP_TIMEOUT: Duration = Duration::from_secs(5);

/// A spawned node process and its log paths.
pub struct NodeProcess {
    child: Child,
    stderr_path: PathBuf,
    stdout_path: PathBuf,
}

impl NodeProcess {
    /// Best-effort read of the captured stderr log.
    pub fn read_stderr(&self) -> String {
        std::fs::read_to_string(&self.stderr_path).unwrap_or_default()
    }

    fn read_stdout(&self) -> String {
        std::fs::read_to_string(&self.stdout_path).unwrap_or_default()
    }

    /// Panic if the process has already exited.
    pub fn assert_running(&mut self, context: &str) {
        if let Ok(Some(status)) = self.child.try_wait() {
            panic!(
                "split-donor exited early ({context}) with status {status}\nstdout:\n{}\nstderr:\n{}",
                self.read_stdout(),
                self.read_stderr()
            );
        }
    }

    /// Kill the process without any graceful shutdown.
    pub fn crash(&mut self) {
        self.child.kill().ok();
        let _ = self.child.wait();
    }
}

impl Drop for NodeProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

fn spawn_node(data_dir: &Path, listen: SocketAddr, envs: &[(&str, &str)]) -> NodeProcess {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).expect("create log dir");
    let stdout_path = log_dir.join("split-donor.out.log");
    let stderr_path = log_dir.join("split-donor.err.log");
    let open_log = |path: &Path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open node log")
    };

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_split-donor"));
    cmd.arg("node")
        .arg("--listen")
        .arg(listen.to_string())
        .arg("--data-dir")
        .arg(data_dir.join("node"))
        .env_remove("SPLIT_DONOR_FAILPOINTS")
        .stdout(Stdio::from(open_log(&stdout_path)))
        .stderr(Stdio::from(open_log(&stderr_path)));
    for (k, v) in envs {
        cmd.env(k, v);
    }

    NodeProcess {
        child: cmd.spawn().expect("failed to spawn split-donor"),
        stderr_path,
        stdout_path,
    }
}

/// Start a node on `data_dir` and block until it answers PING.
pub fn start_ready_node(data_dir: &Path, listen: SocketAddr, envs: &[(&str, &str)]) -> NodeProcess {
    let mut node = spawn_node(data_dir, listen, envs);
    node.assert_running("after spawn");
    let start = Instant::now();
    while !answers_ping(listen) {
        if start.elapsed() >= IO_TIMEOUT {
            panic!(
                "admin port {listen} did not respond to PING in time\nnode stdout:\n{}\nnode stderr:\n{}",
                node.read_stdout(),
                node.read_stderr()
            );
        }
        node.assert_running("while waiting for readiness");
        std::thread::sleep(Duration::from_millis(50));
    }
    node
}

fn answers_ping(addr: SocketAddr) -> bool {
    let Ok(stream) = TcpStream::connect(addr) else {
        return false;
    };
    RespConn::new(stream)
        .send_command(&["PING"])
        .is_ok_and(|reply| reply == "+PONG")
}

/// Reserve a loopback address, or `None` when the sandbox forbids binding.
pub fn reserve_addr(test: &str) -> Option<SocketAddr> {
    match TcpListener::bind("127.0.0.1:0").and_then(|l| l.local_addr()) {
        Ok(addr) => Some(addr),
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping {test}: cannot bind local port ({err})");
            None
        }
        Err(err) => panic!("bind ephemeral port failed: {err}"),
    }
}

/// Blocking RESP connection to the admin port.
pub struct RespConn {
    reader: BufReader<TcpStream>,
}

impl RespConn {
    pub fn connect(addr: SocketAddr) -> Self {
        Self::new(TcpStream::connect(addr).expect("connect admin port"))
    }

    fn new(stream: TcpStream) -> Self {
        stream.set_read_timeout(Some(RESP_TIMEOUT)).ok();
        stream.set_write_timeout(Some(RESP_TIMEOUT)).ok();
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Send a command of bulk strings. Bulk replies come back as their
    /// contents, every other reply as its line with the type prefix.
    fn send_command(&mut self, parts: &[&str]) -> std::io::Result<String> {
        let mut buf = format!("*{}\r\n", parts.len()).into_bytes();
        for part in parts {
            buf.extend_from_slice(format!("${}\r\n{part}\r\n", part.len()).as_bytes());
        }
        self.reader.get_mut().write_all(&buf)?;
        read_reply(&mut self.reader)
    }

    pub fn send_text(&mut self, parts: &[&str]) -> String {
        self.send_command(parts).expect("resp round-trip")
    }

    /// Send a command whose reply is a JSON bulk string.
    pub fn send_json(&mut self, parts: &[&str]) -> serde_json::Value {
        let reply = self.send_text(parts);
        serde_json::from_str(&reply)
            .unwrap_or_else(|err| panic!("expected json reply to {parts:?}, got {reply:?}: {err}"))
    }
}

fn read_reply(reader: &mut BufReader<TcpStream>) -> std::io::Result<String> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    let line = line.trim_end();
    let Some(len) = line.strip_prefix('$') else {
        return Ok(line.to_string());
    };
    let len: i64 = len
        .parse()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    if len < 0 {
        return Ok(String::new());
    }
    let mut data = vec![0u8; len as usize + 2];
    reader.read_exact(&mut data)?;
    data.truncate(len as usize);
    String::from_utf8(data).map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}
