//! SMTP client used to transmit mail to remote hosts.
//!
//! The client speaks plain SMTP: greeting, `EHLO`/`HELO`, `MAIL FROM`,
//! `RCPT TO`, `DATA` and `QUIT`. It does not retry or interpret replies;
//! callers decide what each reply means for delivery.
//!
//! ```no_run
//! use tern_smtp::SmtpClient;
//!
//! # async fn example() -> Result<(), tern_smtp::ClientError> {
//! let mut client = SmtpClient::connect("127.0.0.1:25").await?;
//! let greeting = client.read_greeting().await?;
//! assert!(greeting.is_success());
//!
//! client.ehlo("mail.example.org").await?;
//! client.mail_from("sender@example.org", Some(42)).await?;
//! client.rcpt_to("john@example.com").await?;
//! client.data().await?;
//! client.send_data(b"Subject: hi\r\n\r\nHello\r\n").await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod response;

pub use client::SmtpClient;
pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
