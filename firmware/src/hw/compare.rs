//! Software compare channels driven from one wrapping microsecond alarm.
//!
//! Each channel holds at most one active pulse and one queued pulse. The
//! output task sleeps until [`CompareBank::next_delay_us`], then asks
//! [`CompareBank::service`] which pin edges fell due.

use ecu_core::CYLINDER_COUNT;
use ecu_core::drivers::is_future;
use heapless::Vec;

/// Pin edges one service pass can produce: a forced release, a release and
/// an assert per channel at most.
pub const MAX_EDGES: usize = CYLINDER_COUNT * 3;

pub type EdgeBuffer = Vec<Edge, MAX_EDGES>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Edge {
    Assert(u8),
    /// `due_us` is the commanded release time; `None` for a forced stop.
    Release { channel: u8, due_us: Option<u32> },
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
struct Channel {
    active_release: Option<u32>,
    queued: Option<(u32, u32)>,
    forced_low: bool,
}

#[derive(Debug, Default)]
pub struct CompareBank {
    channels: [Channel; CYLINDER_COUNT],
}

/// `true` once `at` is no longer in the future of `now`.
fn due(at: u32, now: u32) -> bool {
    !is_future(at, now)
}

impl CompareBank {
    pub const fn new() -> Self {
        Self {
            channels: [Channel {
                active_release: None,
                queued: None,
                forced_low: false,
            }; CYLINDER_COUNT],
        }
    }

    /// Queues a pulse, replacing any pulse not yet started on `channel`.
    pub fn arm(&mut self, channel: u8, assert_at: u32, release_at: u32) -> bool {
        let Some(slot) = self.channels.get_mut(usize::from(channel)) else {
            return false;
        };
        slot.queued = Some((assert_at, release_at));
        true
    }

    /// Drops the queued pulse and ends an active one on the next service.
    pub fn disarm(&mut self, channel: u8) -> bool {
        let Some(slot) = self.channels.get_mut(usize::from(channel)) else {
            return false;
        };
        slot.queued = None;
        if slot.active_release.take().is_some() {
            slot.forced_low = true;
        }
        true
    }

    pub fn is_idle(&self) -> bool {
        self.channels
            .iter()
            .all(|slot| slot.active_release.is_none() && slot.queued.is_none() && !slot.forced_low)
    }

    /// Microseconds until the earliest pending edge; zero when one is overdue.
    pub fn next_delay_us(&self, now: u32) -> Option<u32> {
        self.channels
            .iter()
            .flat_map(|slot| {
                let forced = slot.forced_low.then_some(now);
                let queued = slot.queued.map(|(assert_at, _)| assert_at);
                [forced, slot.active_release, queued]
            })
            .flatten()
            .map(|at| if due(at, now) { 0 } else { at.wrapping_sub(now) })
            .min()
    }

    /// Moves every channel past the edges due at `now`.
    pub fn service(&mut self, now: u32, edges: &mut EdgeBuffer) {
        for (index, slot) in self.channels.iter_mut().enumerate() {
            let Ok(channel) = u8::try_from(index) else {
                continue;
            };
            if slot.forced_low {
                slot.forced_low = false;
                let _ = edges.push(Edge::Release { channel, due_us: None });
            }
            if let Some(release_at) = slot.active_release
                && due(release_at, now)
            {
                slot.active_release = None;
                let _ = edges.push(Edge::Release {
                    channel,
                    due_us: Some(release_at),
                });
            }
            if slot.active_release.is_none()
                && let Some((assert_at, release_at)) = slot.queued
                && due(assert_at, now)
            {
                slot.queued = None;
                let _ = edges.push(Edge::Assert(channel));
                if due(release_at, now) {
                    let _ = edges.push(Edge::Release {
                        channel,
                        due_us: Some(release_at),
                    });
                } else {
                    slot.active_release = Some(release_at);
                }
            }
        }
    }
}
