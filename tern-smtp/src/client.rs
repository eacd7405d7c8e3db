use tern_common::outgoing;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, ToSocketAddrs},
};

use crate::{
    error::{ClientError, Result},
    response::Response,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Replies larger than this are treated as a protocol violation.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// A single SMTP client connection.
///
/// Each method sends one command and reads one reply. Timeouts are the
/// caller's concern; wrap calls in `tokio::time::timeout` per stage.
#[derive(Debug)]
pub struct SmtpClient {
    stream: TcpStream,
    buffer: Vec<u8>,
    buffer_pos: usize,
}

impl SmtpClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;

        Ok(Self {
            stream,
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
        })
    }

    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    pub async fn command(&mut self, command: &str) -> Result<Response> {
        outgoing!("{command}");

        self.stream
            .write_all(format!("{command}\r\n").as_bytes())
            .await?;
        self.read_response().await
    }

    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("HELO {domain}")).await
    }

    /// `MAIL FROM:<from>`, with `SIZE=` when the size is known.
    ///
    /// An empty `from` sends the null reverse path `<>`.
    pub async fn mail_from(&mut self, from: &str, size: Option<usize>) -> Result<Response> {
        let command = match size {
            Some(size) => format!("MAIL FROM:<{from}> SIZE={size}"),
            None => format!("MAIL FROM:<{from}>"),
        };

        self.command(&command).await
    }

    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Send the message content, dot-stuffed, followed by the terminating
    /// `<CRLF>.<CRLF>`, and read the final reply.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<Response> {
        outgoing!("<{} bytes of message data>", data.len());

        self.stream.write_all(&dot_stuff(data)).await?;
        self.stream.flush().await?;
        self.read_response().await
    }

    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                tern_common::incoming!("{} {}", response.code, response.message());
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let n = self.stream.read(&mut self.buffer[self.buffer_pos..]).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            self.buffer_pos += n;
        }
    }
}

/// Escape leading dots (RFC 5321 section 4.5.2), end the content with CRLF and
/// append the end-of-data marker.
fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    let mut line_start = true;

    for &byte in data {
        if line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        line_start = byte == b'\n';
    }

    if !out.ends_with(b"\r\n") {
        if out.ends_with(b"\n") {
            out.pop();
        }
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b".\r\n");
    out
}
