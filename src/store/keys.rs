//! Key-space layout for one queue namespace.
//!
//! Every structure the scripts touch hangs off a single prefix,
//! `groupq:<namespace>`, so several namespaces can share one Redis
//! without colliding.

/// Prefix applied to every namespace.
pub const KEY_PREFIX: &str = "groupq";

/// Width of the zero-padded sequence number at the start of a job id.
pub const SEQ_WIDTH: usize = 16;

/// Upper bound on queued wake-up markers in the signal list.
pub const SIGNAL_CAP: usize = 64;

/// Key builder for a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    ns: String,
}

impl Keys {
    pub fn new(namespace: &str) -> Self {
        Self {
            ns: format!("{KEY_PREFIX}:{namespace}"),
        }
    }

    /// The fully prefixed namespace, e.g. `groupq:sessions`.
    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn seq(&self) -> String {
        format!("{}:seq", self.ns)
    }

    pub fn job(&self, job_id: &str) -> String {
        format!("{}:job:{job_id}", self.ns)
    }

    pub fn group(&self, group_id: &str) -> String {
        format!("{}:g:{group_id}", self.ns)
    }

    pub fn ready(&self) -> String {
        format!("{}:ready", self.ns)
    }

    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.ns)
    }

    pub fn lease(&self, job_id: &str) -> String {
        format!("{}:lease:{job_id}", self.ns)
    }

    /// Lease index: job ids scored by lease expiry.
    pub fn processing(&self) -> String {
        format!("{}:processing", self.ns)
    }

    pub fn groups(&self) -> String {
        format!("{}:groups", self.ns)
    }

    pub fn signal(&self) -> String {
        format!("{}:signal", self.ns)
    }
}

/// Build a job id from its sequence number and an opaque suffix.
///
/// The sequence is zero-padded so that lexicographic member order inside a
/// group's sorted set matches numeric `seq` order. Members that share an
/// `orderMs` score are therefore ordered by `seq`.
pub fn job_id(seq: u64, suffix: &str) -> String {
    format!("{seq:0width$}-{suffix}", width = SEQ_WIDTH)
}

/// Recover the sequence number from a job id, if it has the expected shape.
pub fn seq_of(job_id: &str) -> Option<u64> {
    job_id.split_once('-')?.0.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_namespace_prefix() {
        let keys = Keys::new("sessions");
        assert_eq!(keys.ns(), "groupq:sessions");
        assert_eq!(keys.job("7"), "groupq:sessions:job:7");
        assert_eq!(keys.group("abc"), "groupq:sessions:g:abc");
        assert_eq!(keys.ready(), "groupq:sessions:ready");
        assert_eq!(keys.processing(), "groupq:sessions:processing");
    }

    #[test]
    fn job_ids_sort_by_sequence() {
        let mut ids = vec![job_id(10, "ffff"), job_id(9, "0000"), job_id(100, "aaaa")];
        ids.sort();
        assert_eq!(ids, vec![job_id(9, "0000"), job_id(10, "ffff"), job_id(100, "aaaa")]);
        assert_eq!(seq_of(&ids[2]), Some(100));
        assert_eq!(seq_of("corrupted"), None);
    }
}
