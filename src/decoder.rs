//! Reconstruction of the sample stream from the SIGMA's DRAM format.
//!
//! The device does not store one word per sample period. DRAM is organised
//! in 1024 byte lines of 64 clusters, and each cluster holds a 16 bit
//! timestamp followed by seven consecutive events. Between clusters the
//! inputs did not change, so the gap given by the timestamps is filled by
//! repeating the last sample of the previous cluster.

use crate::feed::{DataFeed, Packet};
use crate::register::LINE_SIZE;
use crate::samplerate::is_fast;
use crate::trigger::SigmaTrigger;

pub const EVENTS_PER_CLUSTER: usize = 7;
pub const CLUSTERS_PER_LINE: usize = 64;
pub const EVENTS_PER_LINE: usize = CLUSTERS_PER_LINE * EVENTS_PER_CLUSTER;
/// Timestamp plus seven two byte events.
pub const CLUSTER_SIZE: usize = 2 + 2 * EVENTS_PER_CLUSTER;

/// Logic packets never carry more samples than this.
const BATCH_SAMPLES: usize = 1024;

const UNITSIZE: usize = 2;

/// One cluster inside a DRAM line.
#[derive(Debug, Clone, Copy)]
pub struct DramCluster<'a> {
    bytes: &'a [u8; CLUSTER_SIZE],
}

impl<'a> DramCluster<'a> {
    pub fn new(bytes: &'a [u8; CLUSTER_SIZE]) -> Self {
        Self { bytes }
    }

    /// Cluster `index` of `line`, if the line is long enough to hold it.
    pub fn from_line(line: &'a [u8], index: usize) -> Option<Self> {
        let start = index * CLUSTER_SIZE;
        let bytes = line.get(start..start + CLUSTER_SIZE)?;
        bytes.try_into().ok().map(Self::new)
    }

    pub fn timestamp(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0], self.bytes[1]])
    }

    pub fn sample(&self, event: usize) -> u16 {
        let i = 2 + 2 * event;
        u16::from_le_bytes([self.bytes[i], self.bytes[i + 1]])
    }

    pub fn samples(&self) -> [u16; EVENTS_PER_CLUSTER] {
        std::array::from_fn(|i| self.sample(i))
    }
}

/// Clusters needed to hold `events_in_line` events.
pub fn clusters_in_line(events_in_line: usize) -> usize {
    events_in_line.min(EVENTS_PER_LINE).div_ceil(EVENTS_PER_CLUSTER)
}

/// Events stored in cluster `cluster` of a line holding `events_in_line`.
/// Only the last cluster can be partial.
pub fn events_in_cluster(events_in_line: usize, cluster: usize) -> usize {
    let events_in_line = events_in_line.min(EVENTS_PER_LINE);
    let clusters = clusters_in_line(events_in_line);
    let rest = events_in_line % EVENTS_PER_CLUSTER;
    if cluster + 1 == clusters && rest != 0 {
        rest
    } else if cluster < clusters {
        EVENTS_PER_CLUSTER
    } else {
        0
    }
}

/// Find the exact trigger position within a cluster.
///
/// The hardware trigger fires a little early because of pipeline delay, so
/// the decoded samples are searched for the first one satisfying the
/// trigger condition relative to its predecessor. Without an exact match the
/// start of the cluster is used.
pub fn get_trigger_offset(samples: &[u16], last_sample: u16, trigger: &SigmaTrigger) -> usize {
    let mut previous = last_sample;
    for (i, &sample) in samples.iter().take(8).enumerate() {
        if trigger.matches(previous, sample) {
            return i;
        }
        previous = sample;
    }
    0
}

/// State carried from one cluster to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeState {
    pub lastts: u16,
    pub lastsample: u16,
}

#[derive(Debug)]
pub struct CaptureDecoder {
    state: DecodeState,
    trigger: SigmaTrigger,
    use_triggers: bool,
    samplerate: u64,
    batch: Vec<u8>,
}

impl CaptureDecoder {
    /// `use_triggers` controls whether trigger markers are emitted at all.
    pub fn new(trigger: SigmaTrigger, use_triggers: bool, samplerate: u64) -> Self {
        Self {
            state: DecodeState::default(),
            trigger,
            use_triggers,
            samplerate,
            batch: Vec::with_capacity(BATCH_SAMPLES * UNITSIZE),
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Start a new download: continue from the first cluster's timestamp
    /// with an all-low previous sample.
    pub fn seed(&mut self, first_line: &[u8]) {
        let lastts = DramCluster::from_line(first_line, 0)
            .map(|c| c.timestamp())
            .unwrap_or(0);
        self.state = DecodeState {
            lastts,
            lastsample: 0,
        };
    }

    /// Decode one DRAM line.
    ///
    /// `trigger_event` is the event index within this line the hardware
    /// reported as trigger, if the trigger fired here.
    pub fn decode_line(
        &mut self,
        line: &[u8],
        events_in_line: usize,
        trigger_event: Option<u32>,
        feed: &mut dyn DataFeed,
    ) {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("CaptureDecoder::decode_line"), 0));

        let clusters = clusters_in_line(events_in_line);
        let trigger_cluster = trigger_event
            .map(|ev| ev as usize)
            .filter(|&ev| ev < EVENTS_PER_LINE)
            .map(|ev| {
                let ev = if is_fast(self.samplerate) {
                    ev
                } else {
                    ev - ev.min(EVENTS_PER_CLUSTER - 1)
                };
                ev / EVENTS_PER_CLUSTER
            });

        for i in 0..clusters {
            let Some(cluster) = DramCluster::from_line(line, i) else {
                log::warn!(
                    "DRAM line truncated at {} of {} bytes, dropping {} clusters",
                    line.len(),
                    LINE_SIZE,
                    clusters - i
                );
                break;
            };
            let events = events_in_cluster(events_in_line, i);
            self.decode_cluster(&cluster, events, trigger_cluster == Some(i), feed);
        }
    }

    pub fn decode_cluster(
        &mut self,
        cluster: &DramCluster<'_>,
        events: usize,
        triggered: bool,
        feed: &mut dyn DataFeed,
    ) {
        let events = events.min(EVENTS_PER_CLUSTER);
        let ts = cluster.timestamp();
        let tsdiff = ts.wrapping_sub(self.state.lastts);
        self.state.lastts = ts;

        // A cluster covers EVENTS_PER_CLUSTER periods from its timestamp on,
        // anything beyond that since the previous cluster is unchanged input.
        let padding = usize::from(tsdiff).saturating_sub(EVENTS_PER_CLUSTER);
        self.pad(padding, feed);

        let decoded = cluster.samples();
        let samples = &decoded[..events];

        let mut offset = 0;
        if triggered {
            offset = get_trigger_offset(samples, self.state.lastsample, &self.trigger);
            if offset > 0 {
                self.emit(&samples[..offset], feed);
            }
            if self.use_triggers {
                feed.send(Packet::Trigger);
            }
        }
        if offset < samples.len() {
            self.emit(&samples[offset..], feed);
        }

        if let Some(&last) = samples.last() {
            self.state.lastsample = last;
        }
    }

    fn pad(&mut self, count: usize, feed: &mut dyn DataFeed) {
        let bytes = self.state.lastsample.to_le_bytes();
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(BATCH_SAMPLES);
            self.batch.clear();
            for _ in 0..n {
                self.batch.extend_from_slice(&bytes);
            }
            feed.send(Packet::Logic {
                data: &self.batch,
                unitsize: UNITSIZE,
            });
            remaining -= n;
        }
    }

    fn emit(&mut self, samples: &[u16], feed: &mut dyn DataFeed) {
        self.batch.clear();
        for s in samples {
            self.batch.extend_from_slice(&s.to_le_bytes());
        }
        feed.send(Packet::Logic {
            data: &self.batch,
            unitsize: UNITSIZE,
        });
    }
}
