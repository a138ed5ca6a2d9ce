//! Scripted collaborators shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use parking_lot::Mutex;

use crate::engine::{DecodeEngine, DecodedFrame, PacketSource, Retrieved, SourceEvent, SubmitStatus};
use crate::packet::{Packet, QueueItem, TrackId};

#[derive(Debug, Default, PartialEq)]
pub(crate) struct MockFrame {
    pub pts: Option<i64>,
}

impl DecodedFrame for MockFrame {
    fn pts(&self) -> Option<i64> {
        self.pts
    }
}

/// Engine producing one frame per packet, with a single-frame internal buffer.
#[derive(Default)]
pub(crate) struct ScriptedEngine {
    buffered: VecDeque<MockFrame>,
    draining: bool,
    /// Report `BufferFull` this many times for every packet before accepting it.
    pub busy_rounds: u32,
    busy_left: Option<u32>,
    /// Fail the submit of the packet carrying this timestamp.
    pub fail_at_pts: Option<i64>,
    /// Timestamps in the order the engine accepted them.
    pub accepted: Arc<Mutex<Vec<i64>>>,
    pub busy_reports: Arc<Mutex<u32>>,
}

impl ScriptedEngine {
    /// Engine answering `BufferFull` `rounds` times for every packet.
    pub(crate) fn busy(rounds: u32) -> Self {
        Self {
            busy_rounds: rounds,
            ..Self::default()
        }
    }

    /// Engine failing the submit of the packet stamped `pts`.
    pub(crate) fn failing_at(pts: i64) -> Self {
        Self {
            fail_at_pts: Some(pts),
            ..Self::default()
        }
    }
}

impl DecodeEngine for ScriptedEngine {
    type Frame = MockFrame;

    fn submit(&mut self, input: QueueItem) -> Result<SubmitStatus> {
        if self.draining {
            return Ok(SubmitStatus::InputClosed);
        }
        if !self.buffered.is_empty() {
            return Ok(SubmitStatus::BufferFull(input));
        }
        match input {
            QueueItem::EndMarker => {
                self.draining = true;
                Ok(SubmitStatus::Accepted)
            }
            QueueItem::Packet(p) => {
                if p.pts.is_some() && p.pts == self.fail_at_pts {
                    return Err(anyhow!("corrupt packet at {:?}", p.pts));
                }
                let left = self.busy_left.get_or_insert(self.busy_rounds);
                if *left > 0 {
                    *left -= 1;
                    *self.busy_reports.lock() += 1;
                    return Ok(SubmitStatus::BufferFull(QueueItem::Packet(p)));
                }
                self.busy_left = None;
                self.accepted.lock().push(p.pts.unwrap_or(-1));
                self.buffered.push_back(MockFrame { pts: p.pts });
                Ok(SubmitStatus::Accepted)
            }
        }
    }

    fn retrieve_frame(&mut self) -> Result<Retrieved<MockFrame>> {
        if let Some(f) = self.buffered.pop_front() {
            return Ok(Retrieved::Frame(f));
        }
        if self.draining {
            Ok(Retrieved::Exhausted)
        } else {
            Ok(Retrieved::NeedsMoreInput)
        }
    }
}

/// Source replaying a fixed packet list, then end of stream.
pub(crate) struct VecSource {
    packets: VecDeque<Packet>,
    pub fail_after: Option<usize>,
    served: usize,
}

impl VecSource {
    pub(crate) fn new(packets: Vec<Packet>) -> Self {
        Self {
            packets: packets.into(),
            fail_after: None,
            served: 0,
        }
    }
}

impl PacketSource for VecSource {
    fn next_packet(&mut self) -> Result<SourceEvent> {
        if self.fail_after == Some(self.served) {
            return Err(anyhow!("container read error"));
        }
        self.served += 1;
        Ok(match self.packets.pop_front() {
            Some(p) => SourceEvent::Packet(p),
            None => SourceEvent::EndOfStream,
        })
    }
}

pub(crate) fn packet(track: u32, pts: i64) -> Packet {
    Packet::new(TrackId(track), Some(pts), vec![pts as u8; 4])
}

/// Poll `cond` until it holds or `timeout` elapses.
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
