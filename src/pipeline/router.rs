//! Firmware stream router.
//!
//! Maps packet channels to stream names and forwards packet chunks to the
//! processor of whoever claimed the stream. Frame boundaries are derived here
//! so processors only see start, data and end callbacks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SdkError};
use crate::pipeline::packet::PacketHeader;

/// Identifies a stream owner. Allocated by the SDK context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub u64);

/// Hands out unique [`OwnerId`]s. Clones share the counter.
#[derive(Debug, Clone)]
pub struct OwnerIds {
    next: Arc<AtomicU64>,
}

impl OwnerIds {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next(&self) -> OwnerId {
        OwnerId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for OwnerIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolution and rate negotiated when a stream is claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamResolution {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Consumer of one stream's packets.
///
/// Calls arrive in packet order from the producer thread. `process_data` sees
/// every chunk, including empty packets, so processors can track packet ids.
pub trait StreamProcessor: Send {
    fn start_of_frame(&mut self, header: &PacketHeader);

    /// `offset` is the chunk's position within the packet payload.
    fn process_data(&mut self, header: &PacketHeader, data: &[u8], offset: usize);

    fn end_of_frame(&mut self, header: &PacketHeader);

    /// The stream was re-claimed with a new resolution.
    fn configure(&mut self, _resolution: &StreamResolution) {}
}

struct Claim {
    owner: OwnerId,
    resolution: StreamResolution,
    processor: Option<Box<dyn StreamProcessor>>,
    locked: bool,
}

#[derive(Default)]
struct RouterState {
    channels: HashMap<u8, String>,
    claims: HashMap<String, Claim>,
    unknown_channels: HashSet<u8>,
}

/// Routes packet chunks to claimed stream processors.
#[derive(Default)]
pub struct StreamRouter {
    state: Mutex<RouterState>,
}

impl StreamRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declares that packets on `channel` belong to stream `name`.
    pub fn register_channel(&self, channel: u8, name: impl Into<String>) {
        let name = name.into();
        debug!(channel, stream = %name, "channel registered");
        let mut state = self.lock();
        state.unknown_channels.remove(&channel);
        state.channels.insert(channel, name);
    }

    /// Claims `name` for `owner`. Claiming again as the same owner updates the
    /// resolution and reconfigures the installed processor.
    pub fn claim_stream(&self, name: &str, resolution: StreamResolution, owner: OwnerId) -> Result<()> {
        let mut state = self.lock();
        match state.claims.get_mut(name) {
            Some(claim) if claim.owner != owner => Err(SdkError::AlreadyClaimed(name.to_string())),
            Some(claim) => {
                claim.resolution = resolution;
                if let Some(processor) = claim.processor.as_mut() {
                    processor.configure(&resolution);
                }
                debug!(stream = name, ?resolution, "claim updated");
                Ok(())
            }
            None => {
                state.claims.insert(
                    name.to_string(),
                    Claim {
                        owner,
                        resolution,
                        processor: None,
                        locked: false,
                    },
                );
                info!(stream = name, owner = owner.0, ?resolution, "stream claimed");
                Ok(())
            }
        }
    }

    /// Drops the claim if `owner` holds it. Anything else is a no-op.
    pub fn release_stream(&self, name: &str, owner: OwnerId) {
        let removed = {
            let mut state = self.lock();
            let owned = state.claims.get(name).is_some_and(|claim| claim.owner == owner);
            if owned {
                state.claims.remove(name)
            } else {
                None
            }
        };
        // The processor is dropped outside the router lock.
        if removed.is_some() {
            info!(stream = name, owner = owner.0, "stream released");
        }
    }

    pub fn is_claimed(&self, name: &str) -> bool {
        self.lock().claims.contains_key(name)
    }

    pub fn claim_owner(&self, name: &str) -> Option<OwnerId> {
        self.lock().claims.get(name).map(|claim| claim.owner)
    }

    pub fn resolution(&self, name: &str) -> Option<StreamResolution> {
        self.lock().claims.get(name).map(|claim| claim.resolution)
    }

    fn with_owned_claim<T>(
        &self,
        name: &str,
        owner: OwnerId,
        f: impl FnOnce(&mut Claim) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock();
        match state.claims.get_mut(name) {
            Some(claim) if claim.owner == owner => f(claim),
            _ => Err(SdkError::NotClaimed(name.to_string())),
        }
    }

    /// Pins the current processor until [`StreamRouter::unlock_stream_processor`].
    pub fn lock_stream_processor(&self, name: &str, owner: OwnerId) -> Result<()> {
        self.with_owned_claim(name, owner, |claim| {
            claim.locked = true;
            Ok(())
        })
    }

    pub fn unlock_stream_processor(&self, name: &str, owner: OwnerId) -> Result<()> {
        self.with_owned_claim(name, owner, |claim| {
            claim.locked = false;
            Ok(())
        })
    }

    /// Installs `processor` and returns the previous one.
    pub fn replace_stream_processor(
        &self,
        name: &str,
        owner: OwnerId,
        mut processor: Box<dyn StreamProcessor>,
    ) -> Result<Option<Box<dyn StreamProcessor>>> {
        self.with_owned_claim(name, owner, |claim| {
            if claim.locked {
                return Err(SdkError::ProcessorLocked(name.to_string()));
            }
            processor.configure(&claim.resolution);
            Ok(claim.processor.replace(processor))
        })
    }

    /// Forwards one packet chunk. Unknown channels and unclaimed streams are
    /// ignored; an unknown channel is reported once.
    pub fn process_packet_chunk(&self, header: &PacketHeader, data: &[u8], offset: usize) {
        let mut state = self.lock();
        let state = &mut *state;

        let Some(name) = state.channels.get(&header.channel) else {
            if state.unknown_channels.insert(header.channel) {
                warn!(channel = header.channel, "packets on unknown channel ignored");
            }
            return;
        };
        let Some(processor) = state
            .claims
            .get_mut(name)
            .and_then(|claim| claim.processor.as_mut())
        else {
            return;
        };

        if header.kind.starts_frame() && offset == 0 {
            processor.start_of_frame(header);
        }
        processor.process_data(header, data, offset);
        if header.kind.ends_frame() && offset + data.len() == header.buffer_size as usize {
            processor.end_of_frame(header);
        }
    }
}
