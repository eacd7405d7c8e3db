//! Scriptable SMTP server for transmission tests
//!
//! Answers every command with a configured reply, records what it was sent
//! and tracks how many sessions are open at once, so tests can check both the
//! conversation and the per-host connection cap.
//!
//! ```rust,ignore
//! let server = MockSmtpServer::builder()
//!     .with_rcpt_to_response(550, "5.1.1 User unknown")
//!     .build()
//!     .await?;
//!
//! // point a StaticResolver at server.addr()
//! ```

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

/// A command as the server saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Everything between DATA and the terminating dot, still dot-stuffed.
    Content(Vec<u8>),
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
struct Canned {
    code: u16,
    message: String,
}

impl Canned {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Debug, Clone)]
struct Ehlo {
    code: u16,
    lines: Vec<String>,
}

impl Ehlo {
    fn to_bytes(&self) -> Vec<u8> {
        let mut response = String::new();
        let last = self.lines.len().saturating_sub(1);

        for (i, line) in self.lines.iter().enumerate() {
            let separator = if i == last { ' ' } else { '-' };
            let _ = write!(&mut response, "{}{separator}{line}\r\n", self.code);
        }

        response.into_bytes()
    }
}

#[derive(Debug, Clone)]
struct Script {
    greeting: Canned,
    ehlo: Ehlo,
    helo: Canned,
    mail_from: Canned,
    rcpt_to: Canned,
    data: Canned,
    data_end: Canned,
    quit: Canned,

    response_delay: Option<Duration>,
    drop_after_commands: Option<usize>,
    hang_on_command: Option<usize>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: Canned::new(220, "mock.example.net ESMTP"),
            ehlo: Ehlo {
                code: 250,
                lines: vec![String::from("mock.example.net"), String::from("SIZE 10000000")],
            },
            helo: Canned::new(250, "mock.example.net"),
            mail_from: Canned::new(250, "2.1.0 OK"),
            rcpt_to: Canned::new(250, "2.1.5 OK"),
            data: Canned::new(354, "Start mail input; end with <CRLF>.<CRLF>"),
            data_end: Canned::new(250, "2.0.0 Queued"),
            quit: Canned::new(221, "2.0.0 Bye"),
            response_delay: None,
            drop_after_commands: None,
            hang_on_command: None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    commands: AtomicUsize,
    sessions: AtomicUsize,
    open: AtomicUsize,
    max_open: AtomicUsize,
}

/// Counts a session as open until dropped.
struct OpenSession(Arc<Counters>);

impl OpenSession {
    fn start(counters: Arc<Counters>) -> Self {
        counters.sessions.fetch_add(1, Ordering::SeqCst);
        let open = counters.open.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_open.fetch_max(open, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for OpenSession {
    fn drop(&mut self) {
        self.0.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockSmtpServer {
    addr: SocketAddr,
    received: Arc<RwLock<Vec<SmtpCommand>>>,
    counters: Arc<Counters>,
    shutdown: Arc<AtomicBool>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            script: Script::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every command received so far, across all sessions.
    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.received.read().await.clone()
    }

    pub fn command_count(&self) -> usize {
        self.counters.commands.load(Ordering::SeqCst)
    }

    /// Sessions accepted since start.
    pub fn sessions(&self) -> usize {
        self.counters.sessions.load(Ordering::SeqCst)
    }

    /// The most sessions that were open at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.counters.max_open.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    async fn session(
        mut stream: TcpStream,
        script: Arc<Script>,
        received: Arc<RwLock<Vec<SmtpCommand>>>,
        open: OpenSession,
    ) -> std::io::Result<()> {
        let counters = Arc::clone(&open.0);
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut seen = 0;

        writer.write_all(&script.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            if script.drop_after_commands.is_some_and(|limit| seen >= limit) {
                return Ok(());
            }

            if script.hang_on_command == Some(seen) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(());
            }

            line.clear();
            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }

            seen += 1;
            counters.commands.fetch_add(1, Ordering::SeqCst);

            let text = line.trim_end();
            let (verb, argument) = text.split_once(' ').unwrap_or((text, ""));

            let (reply, command) = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => (script.ehlo.to_bytes(), SmtpCommand::Ehlo(argument.to_string())),
                "HELO" => (script.helo.to_bytes(), SmtpCommand::Helo(argument.to_string())),
                "MAIL" => (
                    script.mail_from.to_bytes(),
                    SmtpCommand::MailFrom(argument.to_string()),
                ),
                "RCPT" => (
                    script.rcpt_to.to_bytes(),
                    SmtpCommand::RcptTo(argument.to_string()),
                ),
                "DATA" => (script.data.to_bytes(), SmtpCommand::Data),
                "QUIT" => {
                    received.write().await.push(SmtpCommand::Quit);
                    // The client may reconnect as soon as it reads the reply
                    drop(open);
                    writer.write_all(&script.quit.to_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                _ => (
                    Canned::new(500, "5.5.2 Unrecognised command").to_bytes(),
                    SmtpCommand::Other(text.to_string()),
                ),
            };

            let reads_content = command == SmtpCommand::Data && script.data.code == 354;
            received.write().await.push(command);

            if let Some(delay) = script.response_delay {
                tokio::time::sleep(delay).await;
            }
            writer.write_all(&reply).await?;
            writer.flush().await?;

            if reads_content {
                let mut content = Vec::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await? == 0 {
                        return Ok(());
                    }
                    if line == ".\r\n" || line == ".\n" {
                        break;
                    }
                    content.extend_from_slice(line.as_bytes());
                }

                received.write().await.push(SmtpCommand::Content(content));
                if let Some(delay) = script.response_delay {
                    tokio::time::sleep(delay).await;
                }
                writer.write_all(&script.data_end.to_bytes()).await?;
                writer.flush().await?;
            }
        }
    }
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct MockSmtpServerBuilder {
    script: Script,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.greeting = Canned::new(code, message);
        self
    }

    /// Reply to EHLO with these lines; the first is the domain.
    #[must_use]
    pub fn with_ehlo_response(mut self, code: u16, lines: &[&str]) -> Self {
        self.script.ehlo = Ehlo {
            code,
            lines: lines.iter().map(ToString::to_string).collect(),
        };
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.mail_from = Canned::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.rcpt_to = Canned::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.data = Canned::new(code, message);
        self
    }

    /// The reply after the terminating dot.
    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.data_end = Canned::new(code, message);
        self
    }

    #[must_use]
    pub const fn with_response_delay(mut self, delay: Duration) -> Self {
        self.script.response_delay = Some(delay);
        self
    }

    /// Close the session without a reply once this many commands were read.
    #[must_use]
    pub const fn with_drop_after_commands(mut self, count: usize) -> Self {
        self.script.drop_after_commands = Some(count);
        self
    }

    /// Stop answering at the command with this index.
    #[must_use]
    pub const fn with_hang_on_command(mut self, index: usize) -> Self {
        self.script.hang_on_command = Some(index);
        self
    }

    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let received = Arc::new(RwLock::new(Vec::new()));
        let counters = Arc::new(Counters::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let server = MockSmtpServer {
            addr,
            received: Arc::clone(&received),
            counters: Arc::clone(&counters),
            shutdown: Arc::clone(&shutdown),
        };

        tokio::spawn(async move {
            while !shutdown.load(Ordering::SeqCst) {
                let Ok(Ok((stream, _))) =
                    timeout(Duration::from_millis(100), listener.accept()).await
                else {
                    continue;
                };

                let script = Arc::clone(&script);
                let received = Arc::clone(&received);
                let counters = Arc::clone(&counters);

                tokio::spawn(async move {
                    let open = OpenSession::start(counters);
                    let _ = MockSmtpServer::session(stream, script, received, open).await;
                });
            }
        });

        Ok(server)
    }
}
