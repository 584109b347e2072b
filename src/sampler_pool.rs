use crate::device::{Device, DeviceError, SamplerDesc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{trace, warn};

struct Entry<S> {
    sampler: S,
    references: u32,
}

/// Shares one sampler object between all requests with identical parameters
pub struct SamplerPool<D: Device> {
    device: Arc<D>,
    entries: HashMap<SamplerDesc, Entry<D::Sampler>>,
    descs: HashMap<D::Sampler, SamplerDesc>,
}

impl<D: Device> SamplerPool<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            entries: HashMap::new(),
            descs: HashMap::new(),
        }
    }

    /// Number of distinct live samplers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn acquire(&mut self, desc: &SamplerDesc) -> Result<D::Sampler, DeviceError> {
        if let Some(entry) = self.entries.get_mut(desc) {
            entry.references += 1;
            return Ok(entry.sampler);
        }

        let sampler = unsafe { self.device.create_sampler(desc)? };
        trace!(?desc, "created sampler");
        self.entries.insert(
            *desc,
            Entry {
                sampler,
                references: 1,
            },
        );
        self.descs.insert(sampler, *desc);
        Ok(sampler)
    }

    /// Drop one reference, destroying the sampler with the last one. Returns false for samplers
    /// this pool doesn't own.
    pub fn release(&mut self, sampler: D::Sampler) -> bool {
        let desc = match self.descs.get(&sampler) {
            Some(desc) => *desc,
            None => return false,
        };
        let last = match self.entries.get_mut(&desc) {
            Some(entry) => {
                entry.references -= 1;
                entry.references == 0
            }
            None => return false,
        };

        if last {
            self.entries.remove(&desc);
            self.descs.remove(&sampler);
            unsafe { self.device.destroy_sampler(sampler) };
        }
        true
    }
}

impl<D: Device> Drop for SamplerPool<D> {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            warn!(count = self.entries.len(), "sampler pool dropped with live samplers");
        }
        for (_, entry) in self.entries.drain() {
            unsafe { self.device.destroy_sampler(entry.sampler) };
        }
    }
}
