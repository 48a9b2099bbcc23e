//! Frontend-side data-plane client.
//!
//! Frontends are stateless: each request picks a random replica, and a
//! `NotLeader` reply redirects to the hinted address (or another random
//! replica when the hint is empty) after a short pause, long enough for an
//! in-flight election to settle. Attempts are bounded; a write that errs out
//! mid-retry may or may not have committed, so callers own idempotency at
//! the application layer.

use crate::store::Album;
use crate::wire::{method, read_frame, write_frame, DataMessage, Request, Response};
use rand::seq::SliceRandom;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no replica answered after {attempts} attempts")]
    Exhausted { attempts: usize },
}

pub struct DataClient {
    logger: slog::Logger,
    replicas: Vec<String>,
    max_attempts: usize,
    retry_delay: Duration,
}

impl DataClient {
    pub fn new(logger: slog::Logger, replicas: Vec<String>) -> Self {
        DataClient {
            logger,
            replicas,
            max_attempts: 8,
            retry_delay: Duration::from_millis(250),
        }
    }

    pub fn with_retry(mut self, max_attempts: usize, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.retry_delay = retry_delay;
        self
    }

    pub async fn get_all_albums(&self) -> Result<Vec<Album>, ClientError> {
        let reply = self.request(DataMessage::request(method::GET_ALL_ALBUMS)).await?;
        Ok(reply.albums)
    }

    pub async fn get_album(&self, id: &str) -> Result<Option<Album>, ClientError> {
        let mut message = DataMessage::request(method::GET_ALBUM);
        message.index = id.to_string();
        let reply = self.request(message).await?;
        if !reply.status {
            return Ok(None);
        }
        Ok(reply.albums.into_iter().next())
    }

    /// Returns the created album (with its assigned id) on success.
    pub async fn add_album(
        &self,
        title: &str,
        artist: &str,
        url: &str,
        year: &str,
    ) -> Result<Option<Album>, ClientError> {
        let mut message = DataMessage::request(method::ADD_ALBUM);
        message.albums.push(album_fields(title, artist, url, year));
        let reply = self.request(message).await?;
        if !reply.status {
            return Ok(None);
        }
        Ok(reply.albums.into_iter().next())
    }

    /// Empty fields leave the stored values unchanged. Returns whether the
    /// edit found its target.
    pub async fn edit_album(
        &self,
        id: &str,
        title: &str,
        artist: &str,
        url: &str,
        year: &str,
    ) -> Result<bool, ClientError> {
        let mut message = DataMessage::request(method::EDIT_ALBUM);
        message.index = id.to_string();
        message.albums.push(album_fields(title, artist, url, year));
        Ok(self.request(message).await?.status)
    }

    pub async fn delete_album(&self, id: &str) -> Result<bool, ClientError> {
        let mut message = DataMessage::request(method::DELETE_ALBUM);
        message.index = id.to_string();
        Ok(self.request(message).await?.status)
    }

    /// One leader-chasing request: random replica first, then follow
    /// `NotLeader` hints, falling back to random picks, up to
    /// `max_attempts` round trips.
    pub async fn request(&self, message: DataMessage) -> Result<DataMessage, ClientError> {
        let mut target: Option<String> = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            let addr = match target.take() {
                Some(addr) => addr,
                None => self.random_replica(),
            };

            match self.round_trip(&addr, &message).await {
                Ok(reply) if reply.is_not_leader() => {
                    slog::debug!(
                        self.logger, "redirected";
                        "replica" => %addr,
                        "hint" => %reply.index,
                    );
                    // A replica may hint itself (leader still applying its
                    // term-begin entry); retrying it after the pause is fine.
                    if !reply.index.is_empty() {
                        target = Some(reply.index);
                    }
                }
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    slog::debug!(self.logger, "replica unreachable"; "replica" => %addr, "error" => %e);
                }
            }
        }

        Err(ClientError::Exhausted {
            attempts: self.max_attempts,
        })
    }

    async fn round_trip(&self, addr: &str, message: &DataMessage) -> io::Result<DataMessage> {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, &Request::Data(message.clone())).await?;
        match read_frame(&mut stream).await? {
            Response::Data(reply) => Ok(reply),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "non-data reply to data request",
            )),
        }
    }

    fn random_replica(&self) -> String {
        self.replicas
            .choose(&mut rand::thread_rng())
            .expect("replica list is never empty")
            .clone()
    }
}

fn album_fields(title: &str, artist: &str, url: &str, year: &str) -> Album {
    Album {
        id: String::new(),
        title: title.to_string(),
        artist: artist.to_string(),
        url: url.to_string(),
        year: year.to_string(),
    }
}
