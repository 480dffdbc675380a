//! In-process FTP server for integration tests.
//!
//! Speaks enough RFC 959 for the client: USER/PASS, TYPE, PASV, REST,
//! SIZE, LIST, STOR, RETR, MKD, RMD, DELE, NOOP, QUIT. Files live in
//! memory; every received command line is logged for order assertions.

#![allow(dead_code)]

use ftpdesk_ftp::FtpConnectionConfig;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// RETR sends file data in chunks of this size.
pub const CHUNK: usize = 64 * 1024;

#[derive(Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    commands: Vec<String>,
    users: HashMap<String, String>,
    greeting: Vec<String>,
    pause_after: Option<usize>,
    pasv_override: Option<String>,
    retr_override: Option<String>,
}

pub struct MockFtpServer {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    task: JoinHandle<()>,
}

impl Drop for MockFtpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockFtpServer {
    pub async fn start() -> Self {
        Self::with_greeting(&["220 ready"]).await
    }

    pub async fn with_greeting(lines: &[&str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut users = HashMap::new();
        users.insert("rw".to_string(), "123".to_string());
        users.insert("readonly".to_string(), "password123".to_string());
        let state = Arc::new(Mutex::new(State {
            users,
            greeting: lines.iter().map(|l| l.to_string()).collect(),
            ..State::default()
        }));

        let shared = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let st = shared.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, st).await;
                });
            }
        });

        Self { addr, state, task }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Client config pointing at this server with short timeouts.
    pub fn config(&self, username: &str, password: &str) -> FtpConnectionConfig {
        let mut config = FtpConnectionConfig::from_address(&self.address(), username, password).unwrap();
        config.connect_timeout_sec = 5;
        config.command_timeout_sec = 5;
        config.data_timeout_sec = 5;
        config
    }

    pub fn put_file(&self, path: &str, content: Vec<u8>) {
        self.state.lock().unwrap().files.insert(path.to_string(), content);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state.lock().unwrap().dirs.contains(path)
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().unwrap().commands.clear();
    }

    /// The next RETR stops sending after `bytes`, waits for the client to
    /// drop the data connection, then answers 426.
    pub fn pause_next_retr_after(&self, bytes: usize) {
        self.state.lock().unwrap().pause_after = Some(bytes);
    }

    /// Answer the next RETR with `reply` alone, without a data phase.
    pub fn answer_next_retr_with(&self, reply: &str) {
        self.state.lock().unwrap().retr_override = Some(reply.to_string());
    }

    /// Answer every PASV with `reply` instead of a real address.
    pub fn override_pasv(&self, reply: &str) {
        self.state.lock().unwrap().pasv_override = Some(reply.to_string());
    }
}

/// Deterministic non-repeating-per-chunk test content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Index of the first command equal to `needle`.
pub fn position(commands: &[String], needle: &str) -> usize {
    commands
        .iter()
        .position(|c| c == needle)
        .unwrap_or_else(|| panic!("{} not in {:?}", needle, commands))
}

async fn reply(wr: &mut OwnedWriteHalf, line: &str) -> io::Result<()> {
    wr.write_all(format!("{}\r\n", line).as_bytes()).await
}

async fn accept_data(listener: Option<TcpListener>) -> Option<TcpStream> {
    let listener = listener?;
    match timeout(Duration::from_secs(5), listener.accept()).await {
        Ok(Ok((stream, _))) => Some(stream),
        _ => None,
    }
}

fn listing(state: &State, dir: &str) -> String {
    let prefix = if dir.is_empty() || dir == "/" {
        "/".to_string()
    } else {
        format!("{}/", dir.trim_end_matches('/'))
    };
    let mut out = String::new();
    for d in state.dirs.iter().filter(|d| d.starts_with(&prefix)) {
        let name = &d[prefix.len()..];
        out.push_str(&format!("drwxr-xr-x 2 ftp ftp 0 Jan 01 00:00 {}\r\n", name));
    }
    for (path, content) in state.files.iter().filter(|(p, _)| p.starts_with(&prefix)) {
        let name = &path[prefix.len()..];
        out.push_str(&format!(
            "-rw-r--r-- 1 ftp ftp {} Jan 01 00:00 {}\r\n",
            content.len(),
            name
        ));
    }
    out
}

async fn serve(stream: TcpStream, state: Arc<Mutex<State>>) -> io::Result<()> {
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();

    let greeting = state.lock().unwrap().greeting.clone();
    for line in &greeting {
        reply(&mut wr, line).await?;
    }

    let mut user: Option<String> = None;
    let mut logged_in = false;
    let mut rest = 0usize;
    let mut pasv: Option<TcpListener> = None;

    while let Some(line) = lines.next_line().await? {
        state.lock().unwrap().commands.push(line.clone());
        let (verb, arg) = match line.split_once(' ') {
            Some((v, a)) => (v.to_ascii_uppercase(), a.to_string()),
            None => (line.to_ascii_uppercase(), String::new()),
        };

        if !logged_in && !matches!(verb.as_str(), "USER" | "PASS" | "QUIT" | "NOOP") {
            reply(&mut wr, "530 Please login with USER and PASS.").await?;
            continue;
        }

        match verb.as_str() {
            "USER" => {
                user = Some(arg);
                reply(&mut wr, "331 Username ok, send password.").await?;
            }
            "PASS" => {
                let expected = match &user {
                    Some(u) => state.lock().unwrap().users.get(u).cloned(),
                    None => None,
                };
                let ok = expected.as_deref() == Some(arg.as_str());
                if ok {
                    logged_in = true;
                    reply(&mut wr, "230 ok").await?;
                } else {
                    reply(&mut wr, "530 bad pass").await?;
                }
            }
            "TYPE" => reply(&mut wr, &format!("200 Type set to {}.", arg)).await?,
            "PASV" => {
                let over = state.lock().unwrap().pasv_override.clone();
                if let Some(text) = over {
                    reply(&mut wr, &text).await?;
                    continue;
                }
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                pasv = Some(listener);
                reply(
                    &mut wr,
                    &format!("227 Entering Passive Mode (127,0,0,1,{},{}).", port >> 8, port & 0xff),
                )
                .await?;
            }
            "REST" => match arg.parse::<usize>() {
                Ok(n) => {
                    rest = n;
                    reply(&mut wr, &format!("350 Restarting at {}.", n)).await?;
                }
                Err(_) => reply(&mut wr, "501 Invalid REST parameter.").await?,
            },
            "SIZE" => {
                let size = state.lock().unwrap().files.get(&arg).map(Vec::len);
                match size {
                    Some(n) => reply(&mut wr, &format!("213 {}", n)).await?,
                    None => reply(&mut wr, "550 No such file.").await?,
                }
            }
            "LIST" => {
                let text = listing(&state.lock().unwrap(), &arg);
                reply(&mut wr, "150 Here comes the directory listing.").await?;
                match accept_data(pasv.take()).await {
                    Some(mut data) => {
                        data.write_all(text.as_bytes()).await?;
                        data.shutdown().await?;
                        drop(data);
                        reply(&mut wr, "226 Directory send OK.").await?;
                    }
                    None => reply(&mut wr, "425 Can't open data connection.").await?,
                }
            }
            "STOR" => {
                reply(&mut wr, "150 Ok to send data.").await?;
                match accept_data(pasv.take()).await {
                    Some(mut data) => {
                        let mut buf = Vec::new();
                        data.read_to_end(&mut buf).await?;
                        state.lock().unwrap().files.insert(arg, buf);
                        reply(&mut wr, "226 Transfer complete.").await?;
                    }
                    None => reply(&mut wr, "425 Can't open data connection.").await?,
                }
            }
            "RETR" => {
                let over = state.lock().unwrap().retr_override.take();
                if let Some(text) = over {
                    pasv = None;
                    reply(&mut wr, &text).await?;
                    continue;
                }
                let content = state.lock().unwrap().files.get(&arg).cloned();
                let start = std::mem::take(&mut rest);
                let Some(content) = content else {
                    pasv = None;
                    reply(&mut wr, "550 Failed to open file.").await?;
                    continue;
                };
                let start = start.min(content.len());
                let pause = state.lock().unwrap().pause_after.take();
                let stop = match pause {
                    Some(p) if p > start && p < content.len() => p,
                    _ => content.len(),
                };

                let name = arg.rsplit('/').next().unwrap_or(&arg).to_string();
                reply(
                    &mut wr,
                    &format!(
                        "150 Opening BINARY mode data connection for {} ({} bytes).",
                        name,
                        content.len()
                    ),
                )
                .await?;
                let Some(mut data) = accept_data(pasv.take()).await else {
                    reply(&mut wr, "425 Can't open data connection.").await?;
                    continue;
                };

                let mut sent = start;
                let mut aborted = false;
                while sent < stop {
                    let end = (sent + CHUNK).min(stop);
                    if data.write_all(&content[sent..end]).await.is_err() {
                        aborted = true;
                        break;
                    }
                    sent = end;
                }

                if stop < content.len() {
                    // Hold the connection open until the client gives up.
                    let mut probe = [0u8; 1];
                    let _ = timeout(Duration::from_secs(10), data.read(&mut probe)).await;
                    aborted = true;
                }
                if !aborted {
                    let _ = data.shutdown().await;
                }
                drop(data);

                if aborted {
                    reply(&mut wr, "426 Connection closed; transfer aborted.").await?;
                } else {
                    reply(&mut wr, "226 Transfer complete.").await?;
                }
            }
            "MKD" => {
                let created = state.lock().unwrap().dirs.insert(arg.clone());
                if created {
                    reply(&mut wr, &format!("257 \"{}\" created", arg)).await?;
                } else {
                    reply(&mut wr, "550 Create directory operation failed.").await?;
                }
            }
            "RMD" => {
                let removed = state.lock().unwrap().dirs.remove(&arg);
                if removed {
                    reply(&mut wr, "250 Remove directory operation successful.").await?;
                } else {
                    reply(&mut wr, "550 Remove directory operation failed.").await?;
                }
            }
            "DELE" => {
                let removed = state.lock().unwrap().files.remove(&arg).is_some();
                if removed {
                    reply(&mut wr, "250 Delete operation successful.").await?;
                } else {
                    reply(&mut wr, "550 Delete operation failed.").await?;
                }
            }
            "NOOP" => reply(&mut wr, "200 NOOP ok.").await?,
            "QUIT" => {
                reply(&mut wr, "221 Goodbye.").await?;
                break;
            }
            _ => reply(&mut wr, "502 Command not implemented.").await?,
        }
    }
    Ok(())
}
