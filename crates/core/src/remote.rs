//! Protocol engine over a non-blocking duplex file descriptor pair
//!
//! Output is queued in memory and flushed by [`Engine::step`]; input is read
//! as it becomes available and decoded frame by frame. Callers wait for I/O
//! with [`Engine::poll`] whenever a step reports [`Step::Poll`].

use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, trace};

use crate::chunk::ChunkId;
use crate::engine::{AbortReason, Engine, EngineError, Step};
use crate::protocol::{
    self, ChunkEncoding, HEADER_SIZE, Message, PROTOCOL_SIZE_MAX, decode_frame, feature,
};

/// Stop accepting payloads once this much output is waiting to be written
pub const OUTPUT_HIGH_WATERMARK: usize = 4 * 1024 * 1024;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Put a descriptor into non-blocking mode
fn set_nonblocking<F: AsFd>(fd: &F) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

/// Production [`Engine`] speaking the wire protocol over `input` / `output`.
pub struct RemoteEngine<R, W> {
    input: R,
    output: W,
    local_features: Option<u64>,
    remote_features: Option<u64>,
    sent_hello: bool,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    /// Bytes of `outbuf` already written
    out_pos: usize,
    requests: VecDeque<ChunkId>,
    requested: HashSet<ChunkId>,
    input_eof: bool,
    output_closed: bool,
    goodbye_received: bool,
    aborted: bool,
    index_eof_sent: bool,
}

impl RemoteEngine<File, File> {
    /// Bind an engine to the process's standard input and output.
    ///
    /// # Errors
    /// Fails if the descriptors cannot be duplicated or made non-blocking.
    pub fn stdio() -> Result<Self, EngineError> {
        let input = File::from(io::stdin().as_fd().try_clone_to_owned()?);
        let output = File::from(io::stdout().as_fd().try_clone_to_owned()?);
        Self::new(input, output)
    }
}

impl<R, W> RemoteEngine<R, W>
where
    R: Read + AsFd,
    W: Write + AsFd,
{
    /// Wrap a duplex channel. Both descriptors are switched to non-blocking mode.
    ///
    /// # Errors
    /// Fails if either descriptor rejects `O_NONBLOCK`.
    pub fn new(input: R, output: W) -> Result<Self, EngineError> {
        set_nonblocking(&input)?;
        set_nonblocking(&output)?;

        Ok(Self {
            input,
            output,
            local_features: None,
            remote_features: None,
            sent_hello: false,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            out_pos: 0,
            requests: VecDeque::new(),
            requested: HashSet::new(),
            input_eof: false,
            output_closed: false,
            goodbye_received: false,
            aborted: false,
            index_eof_sent: false,
        })
    }

    /// Feature flags the peer announced, once its HELLO has arrived
    #[must_use]
    pub fn remote_features(&self) -> Option<u64> {
        self.remote_features
    }

    fn pending_output(&self) -> usize {
        self.outbuf.len() - self.out_pos
    }

    /// Queue our HELLO if it has not gone out yet. Returns whether it was queued now.
    fn ensure_hello(&mut self) -> Result<bool, EngineError> {
        if self.sent_hello {
            return Ok(false);
        }
        let features = self
            .local_features
            .ok_or_else(|| EngineError::Protocol("local features not set".to_string()))?;
        Message::Hello { features }.encode(&mut self.outbuf)?;
        self.sent_hello = true;
        Ok(true)
    }

    fn queue(&mut self, message: &Message) -> Result<(), EngineError> {
        self.ensure_hello()?;
        self.compact_output();
        message.encode(&mut self.outbuf)?;
        Ok(())
    }

    fn compact_output(&mut self) {
        if self.out_pos == self.outbuf.len() {
            self.outbuf.clear();
            self.out_pos = 0;
        } else if self.out_pos > self.outbuf.len() / 2 {
            self.outbuf.drain(..self.out_pos);
            self.out_pos = 0;
        }
    }

    fn wants_input(&self) -> bool {
        !self.input_eof && !self.goodbye_received && !self.aborted
    }

    /// The channel counts as closed once output failed, or once the peer is
    /// done talking and everything queued for it has been written.
    fn check_open(&self) -> Result<(), EngineError> {
        if self.output_closed {
            return Err(EngineError::Closed);
        }
        if (self.input_eof || self.goodbye_received) && self.pending_output() == 0 {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn require_local(&self, bit: u64, what: &str) -> Result<(), EngineError> {
        if self.local_features.unwrap_or(0) & bit == 0 {
            return Err(EngineError::Protocol(format!(
                "cannot send {what}: feature not announced"
            )));
        }
        if self.aborted {
            return Err(EngineError::Protocol(format!(
                "cannot send {what}: session aborted"
            )));
        }
        Ok(())
    }

    /// Payloads are still accepted after input EOF: requests read before the
    /// half-close get answered. A GOODBYE means the peer wants nothing more.
    fn can_put(&mut self) -> Result<bool, EngineError> {
        if self.output_closed || self.goodbye_received {
            return Err(EngineError::Closed);
        }
        Ok(self.remote_features.is_some() && self.pending_output() < OUTPUT_HIGH_WATERMARK)
    }

    /// Decode and handle every complete frame in the input buffer
    fn process_input(&mut self) -> Result<bool, EngineError> {
        let mut consumed = 0;
        let mut handled = false;

        while let Some((message, used)) = decode_frame(&self.inbuf[consumed..])? {
            consumed += used;
            handled = true;
            self.handle(message)?;
            if self.goodbye_received {
                break;
            }
        }

        self.inbuf.drain(..consumed);
        Ok(handled)
    }

    fn handle(&mut self, message: Message) -> Result<(), EngineError> {
        trace!(kind = message.kind(), "received message");

        match message {
            Message::Hello { features } => {
                if self.remote_features.is_some() {
                    return Err(EngineError::Protocol("duplicate hello".to_string()));
                }
                debug!("peer features: {features:#x}");
                self.remote_features = Some(features);
                Ok(())
            }
            Message::Abort { code, reason } => Err(EngineError::PeerAborted { code, reason }),
            _ if self.remote_features.is_none() => Err(EngineError::Protocol(format!(
                "{} message before hello",
                message.kind()
            ))),
            Message::Request(ids) => {
                for id in ids {
                    if self.requested.insert(id) {
                        self.requests.push_back(id);
                    }
                }
                Ok(())
            }
            Message::Goodbye => {
                self.goodbye_received = true;
                Ok(())
            }
            other => Err(EngineError::Protocol(format!(
                "unexpected {} message",
                other.kind()
            ))),
        }
    }

    fn flush_some(&mut self) -> Result<Option<Step>, EngineError> {
        match self.output.write(&self.outbuf[self.out_pos..]) {
            Ok(0) => {
                self.output_closed = true;
                Err(EngineError::Closed)
            }
            Ok(n) => {
                self.out_pos += n;
                if self.out_pos == self.outbuf.len() {
                    self.outbuf.clear();
                    self.out_pos = 0;
                }
                Ok(Some(Step::Progress))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(Some(Step::Progress)),
            Err(e) if matches!(e.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) => {
                self.output_closed = true;
                Err(EngineError::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn fill_some(&mut self) -> Result<Step, EngineError> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        match self.input.read(&mut buf) {
            Ok(0) => {
                // Half-close: whatever is still queued goes out before we report Closed
                debug!("peer closed its input side");
                self.input_eof = true;
                Ok(Step::Progress)
            }
            Ok(n) => {
                self.inbuf.extend_from_slice(&buf[..n]);
                Ok(Step::Progress)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Step::Poll),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(Step::Progress),
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                self.input_eof = true;
                Err(EngineError::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<R, W> Engine for RemoteEngine<R, W>
where
    R: Read + AsFd,
    W: Write + AsFd,
{
    fn set_local_features(&mut self, features: u64) -> Result<(), EngineError> {
        if self.sent_hello {
            return Err(EngineError::Protocol(
                "features already announced".to_string(),
            ));
        }
        if features & !feature::ALL != 0 {
            return Err(EngineError::Protocol(format!(
                "unknown feature bits {features:#x}"
            )));
        }
        self.local_features = Some(features);
        Ok(())
    }

    fn can_put_chunk(&mut self) -> Result<bool, EngineError> {
        self.can_put()
    }

    fn can_put_index(&mut self) -> Result<bool, EngineError> {
        self.can_put()
    }

    fn has_pending_requests(&mut self) -> Result<bool, EngineError> {
        if !self.requests.is_empty() {
            return Ok(true);
        }
        self.check_open()?;
        Ok(false)
    }

    fn step(&mut self) -> Result<Step, EngineError> {
        if self.ensure_hello()? {
            return Ok(Step::Progress);
        }

        if self.output_closed {
            return Err(EngineError::Closed);
        }

        if self.pending_output() == 0 && (self.goodbye_received || self.aborted) {
            return Ok(Step::Finished);
        }

        if self.pending_output() > 0 {
            if let Some(step) = self.flush_some()? {
                return Ok(step);
            }
        }

        if self.input_eof && self.pending_output() == 0 {
            return Err(EngineError::Closed);
        }

        if !self.wants_input() {
            return Ok(Step::Poll);
        }

        if self.process_input()? {
            return Ok(Step::Progress);
        }

        self.fill_some()
    }

    fn poll(&mut self, timeout: Option<Duration>) -> Result<(), EngineError> {
        let timeout = match timeout {
            None => PollTimeout::NONE,
            Some(d) => PollTimeout::try_from(d).unwrap_or(PollTimeout::MAX),
        };

        let want_read = self.wants_input();
        let want_write = self.pending_output() > 0 && !self.output_closed;
        if !want_read && !want_write {
            return Ok(());
        }

        let mut fds = Vec::with_capacity(2);
        if want_read {
            fds.push(PollFd::new(self.input.as_fd(), PollFlags::POLLIN));
        }
        if want_write {
            fds.push(PollFd::new(self.output.as_fd(), PollFlags::POLLOUT));
        }

        loop {
            match poll(&mut fds, timeout) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e).into()),
            }
        }
    }

    fn put_index(&mut self, data: &[u8]) -> Result<(), EngineError> {
        self.require_local(feature::READABLE_INDEX, "index")?;
        if self.index_eof_sent {
            return Err(EngineError::Protocol("index already complete".to_string()));
        }
        self.ensure_hello()?;
        for piece in data.chunks(PROTOCOL_SIZE_MAX - HEADER_SIZE) {
            self.compact_output();
            protocol::write_frame(&mut self.outbuf, protocol::msg::INDEX, &[piece])?;
        }
        Ok(())
    }

    fn put_index_eof(&mut self) -> Result<(), EngineError> {
        self.require_local(feature::READABLE_INDEX, "index end")?;
        self.index_eof_sent = true;
        self.queue(&Message::IndexEof)
    }

    fn next_request(&mut self) -> Result<ChunkId, EngineError> {
        let id = self
            .requests
            .pop_front()
            .ok_or_else(|| EngineError::Protocol("no pending request".to_string()))?;
        self.requested.remove(&id);
        Ok(id)
    }

    fn put_chunk(
        &mut self,
        id: &ChunkId,
        encoding: ChunkEncoding,
        data: &[u8],
    ) -> Result<(), EngineError> {
        self.require_local(feature::READABLE_STORE, "chunk")?;
        self.ensure_hello()?;
        self.compact_output();
        protocol::write_chunk(&mut self.outbuf, id, encoding, data)?;
        Ok(())
    }

    fn put_missing(&mut self, id: &ChunkId) -> Result<(), EngineError> {
        self.require_local(feature::READABLE_STORE, "missing marker")?;
        self.queue(&Message::Missing(*id))
    }

    fn abort(&mut self, reason: AbortReason, message: &str) -> Result<(), EngineError> {
        debug!(code = reason.code(), "aborting session: {message}");
        self.queue(&Message::Abort {
            code: reason.code(),
            reason: message.to_string(),
        })?;
        self.aborted = true;
        Ok(())
    }
}
