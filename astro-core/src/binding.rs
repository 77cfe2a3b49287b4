//! Consumer-side slot bindings.
//!
//! A [`ConsumerBinding`] lives on the consumer (UI) thread and is the only
//! place slot state is read or written. Workers never touch it: the deliver
//! step of a pipeline only sends a [`SlotDelivery`] down a channel, and the
//! consumer applies it in [`ConsumerBinding::drain`] after checking the slot
//! still expects that photo. Results for a slot that has moved on are dropped.

use std::collections::HashMap;
use std::fmt;
use std::ops::AddAssign;
use std::sync::mpsc;
use std::time::Duration;

use tracing::{debug, trace};
use url::Url;

use crate::photo::PhotoId;
use crate::pipeline::{
    Delivery, FetchPipeline, PipelineHandle, PipelineId, WeakPipelineHandle,
};

/// A reusable display position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// A pipeline result addressed to a slot.
#[derive(Debug)]
pub struct SlotDelivery {
    pub slot: SlotId,
    pub key: PhotoId,
    pub result: Delivery,
}

#[derive(Debug)]
struct SlotBinding {
    key: PhotoId,
    pending: Option<WeakPipelineHandle>,
}

/// Outcome counts for one [`ConsumerBinding::drain`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub applied: usize,
    pub failed: usize,
    pub stale: usize,
}

impl DrainSummary {
    pub fn total(&self) -> usize {
        self.applied + self.failed + self.stale
    }
}

impl AddAssign for DrainSummary {
    fn add_assign(&mut self, other: DrainSummary) {
        self.applied += other.applied;
        self.failed += other.failed;
        self.stale += other.stale;
    }
}

pub struct ConsumerBinding {
    slots: HashMap<SlotId, SlotBinding>,
    tx: mpsc::Sender<SlotDelivery>,
    rx: mpsc::Receiver<SlotDelivery>,
}

impl fmt::Debug for ConsumerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerBinding")
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

impl Default for ConsumerBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerBinding {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            slots: HashMap::new(),
            tx,
            rx,
        }
    }

    /// Record that `slot` now shows `key` and waits on `handle`.
    ///
    /// A previous binding to a different pipeline is cancelled. Rebinding the
    /// same pipeline is a no-op.
    pub fn bind(&mut self, slot: SlotId, key: PhotoId, handle: &PipelineHandle) {
        let pending = handle.is_active().then(|| handle.downgrade());
        let previous = self.slots.insert(slot, SlotBinding { key, pending });

        if let Some(previous) = previous
            && let Some(old) = previous.pending
            && old.id() != handle.id()
            && old.cancel()
        {
            debug!(
                %slot,
                old_key = %previous.key,
                new_key = %key,
                "slot reused, cancelled superseded pipeline"
            );
        }
    }

    /// Release `slot`, cancelling whatever it was waiting on. Unknown or
    /// already released slots are ignored.
    pub fn unbind(&mut self, slot: SlotId) {
        let Some(binding) = self.slots.remove(&slot) else {
            return;
        };
        if let Some(pending) = binding.pending
            && pending.cancel()
        {
            debug!(%slot, key = %binding.key, "slot released, cancelled pipeline");
        }
    }

    pub fn expected_key(&self, slot: SlotId) -> Option<PhotoId> {
        self.slots.get(&slot).map(|binding| binding.key)
    }

    /// Pipeline the slot is still waiting on, if it has not finished.
    pub fn pending_pipeline(&self, slot: SlotId) -> Option<PipelineId> {
        let binding = self.slots.get(&slot)?;
        let pending = binding.pending.as_ref()?.upgrade()?;
        pending.is_active().then(|| pending.id())
    }

    pub fn bound_slots(&self) -> impl Iterator<Item = (SlotId, PhotoId)> + '_ {
        self.slots.iter().map(|(slot, binding)| (*slot, binding.key))
    }

    /// Deliver callback that hands the result to this consumer's channel.
    pub fn deliverer(
        &self,
        slot: SlotId,
        key: PhotoId,
    ) -> impl FnOnce(Delivery) + Send + 'static {
        let tx = self.tx.clone();
        move |result| {
            // The consumer may already be gone; nothing to hand off to then.
            let _ = tx.send(SlotDelivery { slot, key, result });
        }
    }

    /// Request `key` for `slot` and bind the slot to the resulting pipeline.
    pub fn load(
        &mut self,
        pipeline: &FetchPipeline,
        slot: SlotId,
        key: PhotoId,
        url: Url,
    ) -> PipelineHandle {
        let handle = pipeline.request(key, url, self.deliverer(slot, key));
        self.bind(slot, key, &handle);
        handle
    }

    /// Apply every delivery already queued, without waiting.
    pub fn drain<F>(&mut self, mut apply: F) -> DrainSummary
    where
        F: FnMut(SlotId, PhotoId, Delivery),
    {
        let mut summary = DrainSummary::default();
        while let Ok(delivery) = self.rx.try_recv() {
            summary += self.apply_one(delivery, &mut apply);
        }
        summary
    }

    /// Block the consumer thread until one delivery arrives or `timeout`
    /// elapses, then apply it.
    pub fn next_delivery<F>(
        &mut self,
        timeout: Duration,
        mut apply: F,
    ) -> Option<DrainSummary>
    where
        F: FnMut(SlotId, PhotoId, Delivery),
    {
        let delivery = self.rx.recv_timeout(timeout).ok()?;
        Some(self.apply_one(delivery, &mut apply))
    }

    fn apply_one<F>(&mut self, delivery: SlotDelivery, apply: &mut F) -> DrainSummary
    where
        F: FnMut(SlotId, PhotoId, Delivery),
    {
        let SlotDelivery { slot, key, result } = delivery;
        let mut summary = DrainSummary::default();

        let Some(binding) = self.slots.get_mut(&slot) else {
            trace!(%slot, %key, "discarding delivery for released slot");
            summary.stale = 1;
            return summary;
        };
        if binding.key != key {
            trace!(
                %slot,
                %key,
                expected = %binding.key,
                "discarding stale delivery"
            );
            summary.stale = 1;
            return summary;
        }

        binding.pending = None;
        if result.is_ok() {
            summary.applied = 1;
        } else {
            summary.failed = 1;
        }
        apply(slot, key, result);
        summary
    }
}
