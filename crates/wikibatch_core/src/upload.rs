//! Chunked uploads into the server-side stash, followed by one publishing
//! commit.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::thread::sleep;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::actions::with_retry;
use crate::error::{ApiError, ApiResult, ErrorKind};
use crate::reply::Reply;
use crate::session::Session;
use crate::transport::{params, set_param};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
}

/// One slice of the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u64,
    pub offset: u64,
    pub len: u64,
}

impl ChunkPlan {
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        Self {
            file_size,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u64 {
        self.file_size.div_ceil(self.chunk_size)
    }

    /// Length of chunk `index`; only the last chunk may be short.
    pub fn chunk_len(&self, index: u64) -> u64 {
        let offset = index.saturating_mul(self.chunk_size);
        self.file_size.saturating_sub(offset).min(self.chunk_size)
    }

    pub fn chunks(&self) -> impl Iterator<Item = ChunkSpan> + '_ {
        (0..self.chunk_count()).map(|index| ChunkSpan {
            index,
            offset: index * self.chunk_size,
            len: self.chunk_len(index),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Streaming,
    Committing,
    Done,
    Failed,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload source is empty")]
    EmptyFile,

    #[error("upload already ran and is {0:?}")]
    NotIdle(UploadState),

    #[error("failed to open upload source: {0}")]
    Open(#[from] io::Error),

    #[error("failed to read chunk {index} at offset {offset}: {source}")]
    Read {
        index: u64,
        offset: u64,
        filekey: Option<String>,
        source: io::Error,
    },

    #[error("chunk {index} at offset {offset} failed: {source}")]
    Chunk {
        index: u64,
        offset: u64,
        filekey: Option<String>,
        source: ApiError,
    },

    #[error("chunk {index} was acknowledged without a filekey")]
    MissingFileKey { index: u64, filekey: Option<String> },

    #[error("commit of stashed file {filekey} failed: {source}")]
    Commit { filekey: String, source: ApiError },
}

impl UploadError {
    /// Last stash key the server issued, for manual recovery.
    pub fn filekey(&self) -> Option<&str> {
        match self {
            Self::Read { filekey, .. }
            | Self::Chunk { filekey, .. }
            | Self::MissingFileKey { filekey, .. } => filekey.as_deref(),
            Self::Commit { filekey, .. } => Some(filekey.as_str()),
            Self::EmptyFile | Self::NotIdle(_) | Self::Open(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub filename: String,
    pub filekey: String,
    pub chunks: u64,
    pub bytes: u64,
    /// Published by the salvage commit after the regular path failed.
    pub salvaged: bool,
}

/// Drives one file through `Idle -> Streaming -> Committing -> Done | Failed`.
///
/// The source is read once, front to back. A chunk that fails is re-sent
/// from the buffer it was read into; acknowledged chunks are never sent
/// again.
pub struct ChunkedUpload<'s> {
    session: &'s Session,
    title: String,
    filename: String,
    description: String,
    summary: String,
    chunk_size: u64,
    attempts: usize,
    state: UploadState,
    filekey: Option<String>,
    acknowledged: u64,
}

impl<'s> ChunkedUpload<'s> {
    pub fn new(session: &'s Session, title: &str, description: &str, summary: &str) -> Self {
        let settings = session.settings();
        Self {
            session,
            title: title.to_string(),
            filename: session.namespaces().strip_namespace(title).to_string(),
            description: description.to_string(),
            summary: summary.to_string(),
            chunk_size: settings.chunk_size,
            attempts: settings.chunk_attempts,
            state: UploadState::Idle,
            filekey: None,
            acknowledged: 0,
        }
    }

    pub fn chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn filekey(&self) -> Option<&str> {
        self.filekey.as_deref()
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn run_from_path(&mut self, path: &Path) -> Result<UploadOutcome, UploadError> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        self.run(file, file_size)
    }

    pub fn run<R: Read>(&mut self, mut reader: R, file_size: u64) -> Result<UploadOutcome, UploadError> {
        if self.state != UploadState::Idle {
            return Err(UploadError::NotIdle(self.state));
        }
        if file_size == 0 {
            self.state = UploadState::Failed;
            return Err(UploadError::EmptyFile);
        }

        let plan = ChunkPlan::new(file_size, self.chunk_size);
        info!(
            title = %self.title,
            file_size,
            chunks = plan.chunk_count(),
            "starting chunked upload"
        );

        self.state = UploadState::Streaming;
        let filekey = match self.stream(&mut reader, &plan) {
            Ok(filekey) => filekey,
            Err(error) => return self.salvage(&plan, error),
        };

        self.state = UploadState::Committing;
        let first = match self.commit(&filekey, None) {
            Ok(_) => return Ok(self.finish(&plan, filekey, false)),
            Err(error) => error,
        };
        warn!(
            title = %self.title,
            filekey = %filekey,
            error = %first,
            "commit failed; attempting salvage commit"
        );
        match self.commit(&filekey, Some(&first)) {
            Ok(_) => Ok(self.finish(&plan, filekey, true)),
            Err(source) => {
                self.state = UploadState::Failed;
                warn!(title = %self.title, filekey = %filekey, "upload failed; stash key kept for recovery");
                Err(UploadError::Commit { filekey, source })
            }
        }
    }

    fn stream<R: Read>(&mut self, reader: &mut R, plan: &ChunkPlan) -> Result<String, UploadError> {
        let file_size = plan.file_size().to_string();
        let mut buffer = Vec::new();

        for span in plan.chunks() {
            buffer.resize(span.len as usize, 0);
            reader
                .read_exact(&mut buffer)
                .map_err(|source| UploadError::Read {
                    index: span.index,
                    offset: span.offset,
                    filekey: self.filekey.clone(),
                    source,
                })?;

            let offset = span.offset.to_string();
            let reply = with_retry(self.session, self.attempts, "upload chunk", |token| {
                let mut request = params(&[
                    ("action", "upload"),
                    ("stash", "1"),
                    ("filename", self.filename.as_str()),
                    ("filesize", file_size.as_str()),
                    ("offset", offset.as_str()),
                    ("ignorewarnings", "1"),
                    ("token", token),
                ]);
                if let Some(filekey) = &self.filekey {
                    set_param(&mut request, "filekey", filekey.as_str());
                }
                self.session
                    .transport()
                    .multipart_post(&request, &self.filename, buffer.clone())
            })
            .map_err(|source| UploadError::Chunk {
                index: span.index,
                offset: span.offset,
                filekey: self.filekey.clone(),
                source,
            })?;

            let Some(filekey) = reply.str_at("/upload/filekey") else {
                return Err(UploadError::MissingFileKey {
                    index: span.index,
                    filekey: self.filekey.clone(),
                });
            };
            self.filekey = Some(filekey.to_string());
            self.acknowledged += 1;
            info!(
                title = %self.title,
                chunk = span.index + 1,
                of = plan.chunk_count(),
                offset = span.offset,
                "chunk acknowledged"
            );
        }

        self.filekey.clone().ok_or(UploadError::MissingFileKey {
            index: plan.chunk_count().saturating_sub(1),
            filekey: None,
        })
    }

    /// Streaming stopped early. If the server already holds a stash key the
    /// stash may be complete despite the failed reply, so try one commit.
    fn salvage(&mut self, plan: &ChunkPlan, error: UploadError) -> Result<UploadOutcome, UploadError> {
        let Some(filekey) = self.filekey.clone() else {
            self.state = UploadState::Failed;
            warn!(title = %self.title, error = %error, "upload failed before any chunk was acknowledged");
            return Err(error);
        };

        self.state = UploadState::Committing;
        warn!(
            title = %self.title,
            filekey = %filekey,
            acknowledged = self.acknowledged,
            error = %error,
            "streaming interrupted; attempting salvage commit"
        );
        match self.commit(&filekey, None) {
            Ok(_) => Ok(self.finish(plan, filekey, true)),
            Err(commit_error) => {
                self.state = UploadState::Failed;
                warn!(
                    title = %self.title,
                    filekey = %filekey,
                    error = %commit_error,
                    "salvage commit failed; stash key kept for recovery"
                );
                Err(error)
            }
        }
    }

    /// One publishing request. `previous` is the failure of an earlier commit
    /// for the same stash key.
    fn commit(&self, filekey: &str, previous: Option<&ApiError>) -> ApiResult<Reply> {
        let token = match previous.map(ApiError::kind) {
            Some(ErrorKind::BadToken) => {
                let stale = self.session.csrf_token()?;
                self.session.refresh_csrf_token(Some(&stale))?
            }
            Some(ErrorKind::RateLimited) => {
                sleep(self.session.settings().retry.rate_limit_backoff);
                self.session.csrf_token()?
            }
            _ => self.session.csrf_token()?,
        };

        debug!(filename = %self.filename, filekey, "committing stashed upload");
        let reply = self
            .session
            .transport()
            .post(&params(&[
                ("action", "upload"),
                ("filename", self.filename.as_str()),
                ("filekey", filekey),
                ("text", self.description.as_str()),
                ("comment", self.summary.as_str()),
                ("ignorewarnings", "1"),
                ("token", token.as_str()),
            ]))?
            .into_result()?;
        match reply.str_at("/upload/result") {
            Some("Success") => Ok(reply),
            other => Err(ApiError::Api {
                code: "uploadfailed".to_string(),
                info: format!(
                    "commit of {} returned {}",
                    self.filename,
                    other.unwrap_or("no result")
                ),
            }),
        }
    }

    fn finish(&mut self, plan: &ChunkPlan, filekey: String, salvaged: bool) -> UploadOutcome {
        self.state = UploadState::Done;
        info!(title = %self.title, salvaged, "upload published");
        UploadOutcome {
            filename: self.filename.clone(),
            filekey,
            chunks: self.acknowledged,
            bytes: plan.file_size(),
            salvaged,
        }
    }
}
