//! ## Job Manager
//!
//! Fixed ring of outstanding work. Job ids come from an atomic counter and a job lives in
//! slot `id % JOB_BUFFER_SIZE` until a newer id overwrites it, so at most
//! `JOB_BUFFER_SIZE` ids are ever valid. Lookups compare the stored id and report a miss
//! on any mismatch.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, RwLock,
};

use serde_json::{json, Value};

use crate::node::BlockTemplate;

/// Roughly four minutes of work at one template per second.
pub const JOB_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub struct WorkJob {
    pub id: u32,
    pub template: BlockTemplate,
    /// `[id, [u64; 4] header words, timestamp]`
    pub normal_params: Vec<Value>,
    /// `[id, hex(header || timestamp)]`, for miners that expect a single blob.
    pub big_params: Vec<Value>,
}

impl WorkJob {
    pub fn blue_score(&self) -> u64 {
        self.template.header.blue_score
    }

    pub fn params(&self, big_job: bool) -> &[Value] {
        if big_job {
            &self.big_params
        } else {
            &self.normal_params
        }
    }
}

pub struct JobManager {
    slots: Box<[RwLock<Option<Arc<WorkJob>>>]>,
    counter: AtomicU32,
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl JobManager {
    pub fn new() -> Self {
        let slots = (0..JOB_BUFFER_SIZE)
            .map(|_| RwLock::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            counter: AtomicU32::new(0),
        }
    }

    pub fn add_job(&self, template: BlockTemplate) -> Arc<WorkJob> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let job = Arc::new(WorkJob {
            id,
            normal_params: normal_job_params(id, &template),
            big_params: big_job_params(id, &template),
            template,
        });

        let mut slot = self.slots[slot_index(id)]
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(job.clone());
        job
    }

    /// Returns `None` once the job has been evicted by a newer id.
    pub fn get_job(&self, id: u32) -> Option<Arc<WorkJob>> {
        let slot = self.slots[slot_index(id)]
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.as_ref().filter(|job| job.id == id).cloned()
    }

    /// Id of the most recently issued job, 0 before the first one.
    pub fn latest_id(&self) -> u32 {
        self.counter.load(Ordering::SeqCst)
    }
}

fn slot_index(id: u32) -> usize {
    id as usize % JOB_BUFFER_SIZE
}

/// Splits the 32-byte header commitment into four little-endian u64 words.
pub fn header_words(pre_pow_hash: &[u8; 32]) -> [u64; 4] {
    let mut words = [0u64; 4];
    for (word, chunk) in words.iter_mut().zip(pre_pow_hash.chunks_exact(8)) {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        *word = u64::from_le_bytes(bytes);
    }
    words
}

fn normal_job_params(id: u32, template: &BlockTemplate) -> Vec<Value> {
    vec![
        json!(id.to_string()),
        json!(header_words(&template.header.pre_pow_hash)),
        json!(template.header.timestamp_ms),
    ]
}

fn big_job_params(id: u32, template: &BlockTemplate) -> Vec<Value> {
    let mut blob = Vec::with_capacity(40);
    blob.extend_from_slice(&template.header.pre_pow_hash);
    blob.extend_from_slice(&template.header.timestamp_ms.to_le_bytes());
    vec![json!(id.to_string()), json!(hex::encode(blob))]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::TemplateHeader;

    fn template(blue_score: u64) -> BlockTemplate {
        let mut pre_pow_hash = [0u8; 32];
        pre_pow_hash[0] = 0x01;
        pre_pow_hash[8] = 0x02;
        BlockTemplate {
            header: TemplateHeader {
                pre_pow_hash,
                timestamp_ms: 0x0102,
                blue_score,
                daa_score: blue_score,
                bits: 0,
            },
            body: Value::Null,
        }
    }

    #[test]
    fn test_evicted_after_wraparound() {
        let jm = JobManager::new();
        for i in 0..10_000u64 {
            jm.add_job(template(i));
        }
        assert!(jm.get_job(100).is_none());
        let job = jm.get_job(9997).unwrap();
        assert_eq!(job.id, 9997);
        assert_eq!(job.blue_score(), 9996);

        let latest = jm.latest_id();
        assert!(jm.get_job(latest).is_some());
        assert!(jm.get_job(latest - JOB_BUFFER_SIZE as u32).is_none());
        assert!(jm.get_job(latest - JOB_BUFFER_SIZE as u32 + 1).is_some());
    }

    #[test]
    fn test_unknown_id_before_any_job() {
        let jm = JobManager::new();
        assert!(jm.get_job(0).is_none());
        assert!(jm.get_job(1).is_none());
        assert_eq!(jm.add_job(template(1)).id, 1);
    }

    #[test]
    fn test_job_param_encodings() {
        let jm = JobManager::new();
        let job = jm.add_job(template(5));

        assert_eq!(job.normal_params[0], json!("1"));
        assert_eq!(job.normal_params[1], json!([1u64, 2u64, 0u64, 0u64]));
        assert_eq!(job.normal_params[2], json!(0x0102u64));

        assert_eq!(job.big_params.len(), 2);
        let blob = job.big_params[1].as_str().unwrap();
        assert_eq!(blob.len(), 80);
        assert!(blob.starts_with("01"));
        assert!(blob.ends_with("0201000000000000"));
        assert_eq!(job.params(true), &job.big_params[..]);
        assert_eq!(job.params(false), &job.normal_params[..]);
    }
}
