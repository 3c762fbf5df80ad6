use crate::feed::{DataFeed, Packet};
use polars::prelude::*;

const SAMPLE_COLUMN_NAME: &str = "sample";
const TIME_COLUMN_NAME: &str = "time";
const TRIGGER_COLUMN_NAME: &str = "trigger";

/// Collects a whole acquisition in memory.
///
/// Logic packets are decoded as 16 bit little endian events. Trigger markers
/// are remembered as the index of the event that follows them.
#[derive(Debug, Default, Clone)]
pub struct LogicCapture {
    samples: Vec<u16>,
    triggers: Vec<usize>,
    ended: bool,
}

impl LogicCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> &[u16] {
        &self.samples
    }

    pub fn triggers(&self) -> &[usize] {
        &self.triggers
    }

    pub fn is_complete(&self) -> bool {
        self.ended
    }

    /// Tabulate the capture: a `time` column in seconds, the raw `sample`, a
    /// `trigger` flag and one `ch{n}` boolean column per channel.
    pub fn to_dataframe(&self, samplerate: u64, num_channels: usize) -> PolarsResult<DataFrame> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("LogicCapture::to_dataframe"), 0));

        let raw: Vec<u32> = self.samples.iter().map(|&s| u32::from(s)).collect();
        let mut triggered = vec![false; self.samples.len()];
        for &t in &self.triggers {
            if let Some(flag) = triggered.get_mut(t) {
                *flag = true;
            }
        }

        let mut columns: Vec<Column> = vec![
            Series::new(SAMPLE_COLUMN_NAME.into(), raw).into(),
            Series::new(TRIGGER_COLUMN_NAME.into(), triggered).into(),
        ];
        for ch in 0..num_channels.min(16) {
            let bits: Vec<bool> = self.samples.iter().map(|&s| (s >> ch) & 1 == 1).collect();
            columns.push(Series::new(format!("ch{}", ch).into(), bits).into());
        }

        let period_s = if samplerate == 0 {
            0.0
        } else {
            1.0 / samplerate as f64
        };
        let mut selection = vec![
            col(TIME_COLUMN_NAME),
            col(SAMPLE_COLUMN_NAME),
            col(TRIGGER_COLUMN_NAME),
        ];
        selection.extend((0..num_channels.min(16)).map(|ch| col(format!("ch{}", ch))));

        DataFrame::new(columns)?
            .lazy()
            .with_row_index("row_index", Some(0))
            .with_columns([(col("row_index").cast(DataType::Float64) * lit(period_s))
                .alias(TIME_COLUMN_NAME)])
            .select(selection)
            .collect()
    }
}

impl DataFeed for LogicCapture {
    fn send(&mut self, packet: Packet<'_>) {
        match packet {
            Packet::Logic { data, unitsize } => {
                if unitsize != 2 {
                    log::warn!("Ignoring logic packet with unit size {}", unitsize);
                    return;
                }
                self.samples.extend(
                    data.chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]])),
                );
            }
            Packet::Trigger => self.triggers.push(self.samples.len()),
            Packet::End => self.ended = true,
        }
    }
}
