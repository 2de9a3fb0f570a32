//! Byte-channel transport: TCP glue and an in-process loopback.
//!
//! A `Channel` carries whole frame payloads reliably and in order between two
//! endpoints. Nothing here spawns a thread: each channel exposes `process_io`
//! as the work function a caller drives, exactly like the sequencer and the
//! client library above it. Outbound buffers are move-owned on enqueue;
//! drained inbound frames are handed out as read-only `Bytes` views.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, TryRecvError};

use crate::frame::{FrameDecoder, encode_frame};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1 << 20;

/// A reliable, in-order, length-delimited byte channel.
pub trait Channel {
    /// Queue one frame payload for transmission. The buffer is move-owned;
    /// actual sending is deferred to `process_io`.
    fn queue_frame(&mut self, payload: Vec<u8>);

    /// Drain every fully received frame payload.
    fn drain_frames(&mut self) -> Vec<Bytes>;

    /// Work function: push queued outbound bytes, pull available inbound
    /// bytes. Never blocks. Returns `false` once the channel is closed.
    fn process_io(&mut self) -> bool;

    fn is_closed(&self) -> bool;

    /// Release the channel. Further sends are dropped.
    fn close(&mut self);
}

/// One end of a TCP connection, nonblocking, with partial-frame resume in
/// both directions.
#[derive(Debug)]
pub struct TcpChannel {
    stream: TcpStream,
    decoder: FrameDecoder,
    inbound: Vec<Bytes>,
    outbound: VecDeque<Vec<u8>>,
    front_written: usize,
    max_frame_bytes: usize,
    closed: bool,
}

impl TcpChannel {
    /// (BLOCKING) Connect to a fabric server.
    pub fn connect(addr: impl ToSocketAddrs, max_frame_bytes: usize) -> io::Result<TcpChannel> {
        let stream = TcpStream::connect(addr)?;
        TcpChannel::from_stream(stream, max_frame_bytes)
    }

    fn from_stream(stream: TcpStream, max_frame_bytes: usize) -> io::Result<TcpChannel> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        Ok(TcpChannel {
            stream,
            decoder: FrameDecoder::new(max_frame_bytes),
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            front_written: 0,
            max_frame_bytes,
            closed: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn push_outbound(&mut self) {
        while !self.outbound.is_empty() {
            let front_len = self.outbound[0].len();
            let result = self.stream.write(&self.outbound[0][self.front_written..]);
            match result {
                Ok(0) => {
                    self.mark_closed();
                    return;
                }
                Ok(n) => {
                    self.front_written += n;
                    if self.front_written == front_len {
                        self.outbound.pop_front();
                        self.front_written = 0;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::debug!(error = %err, "tcp write failed");
                    self.mark_closed();
                    return;
                }
            }
        }
    }

    fn pull_inbound(&mut self) {
        let mut scratch = [0u8; 8192];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => {
                    if self.decoder.mid_frame() {
                        tracing::warn!("peer closed mid-frame");
                    }
                    self.mark_closed();
                    return;
                }
                Ok(n) => {
                    self.decoder.feed(&scratch[..n]);
                    loop {
                        match self.decoder.next_frame() {
                            Ok(Some(frame)) => self.inbound.push(frame),
                            Ok(None) => break,
                            Err(err) => {
                                tracing::warn!(error = %err, "bad frame header");
                                self.mark_closed();
                                return;
                            }
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::debug!(error = %err, "tcp read failed");
                    self.mark_closed();
                    return;
                }
            }
        }
    }

    fn mark_closed(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Channel for TcpChannel {
    fn queue_frame(&mut self, payload: Vec<u8>) {
        if self.closed {
            return;
        }
        match encode_frame(&payload, self.max_frame_bytes) {
            Ok(framed) => self.outbound.push_back(framed),
            Err(err) => {
                tracing::warn!(error = %err, "dropping unsendable frame");
                self.mark_closed();
            }
        }
    }

    fn drain_frames(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.inbound)
    }

    fn process_io(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.push_outbound();
        if !self.closed {
            self.pull_inbound();
        }
        !self.closed
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.mark_closed();
    }
}

/// Accept glue handing new byte channels to the sequencing layer.
#[derive(Debug)]
pub struct TcpChannelListener {
    listener: TcpListener,
    max_frame_bytes: usize,
}

impl TcpChannelListener {
    /// Bind a listener. Port 0 picks a free port; `local_addr` reports it.
    pub fn bind(addr: impl ToSocketAddrs, max_frame_bytes: usize) -> io::Result<TcpChannelListener> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(TcpChannelListener {
            listener,
            max_frame_bytes,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept one incoming connection if one is pending.
    pub fn accept(&self) -> io::Result<Option<TcpChannel>> {
        match self.listener.accept() {
            Ok((stream, _)) => Ok(Some(TcpChannel::from_stream(stream, self.max_frame_bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// In-process channel pair for tests and single-process fabrics. Frames
/// travel whole, so no length framing is involved.
#[derive(Debug)]
pub struct LoopbackChannel {
    tx: Option<Sender<Vec<u8>>>,
    rx: Receiver<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    inbound: Vec<Bytes>,
    closed: bool,
}

impl LoopbackChannel {
    pub fn pair() -> (LoopbackChannel, LoopbackChannel) {
        let (a_tx, a_rx) = crossbeam::channel::unbounded();
        let (b_tx, b_rx) = crossbeam::channel::unbounded();
        (
            LoopbackChannel::from_parts(a_tx, b_rx),
            LoopbackChannel::from_parts(b_tx, a_rx),
        )
    }

    fn from_parts(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> LoopbackChannel {
        LoopbackChannel {
            tx: Some(tx),
            rx,
            outbound: VecDeque::new(),
            inbound: Vec::new(),
            closed: false,
        }
    }
}

impl Channel for LoopbackChannel {
    fn queue_frame(&mut self, payload: Vec<u8>) {
        if !self.closed {
            self.outbound.push_back(payload);
        }
    }

    fn drain_frames(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.inbound)
    }

    fn process_io(&mut self) -> bool {
        if self.closed {
            return false;
        }
        while let Some(frame) = self.outbound.pop_front() {
            let sent = self.tx.as_ref().map(|tx| tx.send(frame).is_ok());
            if sent != Some(true) {
                self.closed = true;
                return false;
            }
        }
        loop {
            match self.rx.try_recv() {
                Ok(frame) => self.inbound.push(Bytes::from(frame)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        !self.closed
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.closed = true;
        self.tx = None;
    }
}
