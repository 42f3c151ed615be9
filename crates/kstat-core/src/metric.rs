//! Samples produced by a scrape.
//!
//! A [`Sample`] pairs a shared [`Descriptor`] with one label value and the
//! final numeric value. Samples are handed to a [`SampleSink`] in traversal
//! order; serializing them for a scrape endpoint is left to the sink.

use std::sync::Arc;

use crate::collector::descriptor::Descriptor;

/// One observation of a metric series.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub desc: Arc<Descriptor>,
    /// Value of the descriptor's single label.
    pub label_value: String,
    pub value: f64,
}

impl Sample {
    pub fn new(desc: Arc<Descriptor>, label_value: impl Into<String>, value: f64) -> Self {
        Self {
            desc,
            label_value: label_value.into(),
            value,
        }
    }

    /// Fully qualified metric name.
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    /// Label pairs of this sample.
    pub fn labels(&self) -> [(&str, &str); 1] {
        [(self.desc.label.as_str(), self.label_value.as_str())]
    }
}

impl std::fmt::Display for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{{{}=\"{}\"}} {}",
            self.desc.name, self.desc.label, self.label_value, self.value
        )
    }
}

/// Receiver of emitted samples.
pub trait SampleSink {
    fn emit(&mut self, sample: Sample);
}

impl SampleSink for Vec<Sample> {
    fn emit(&mut self, sample: Sample) {
        self.push(sample);
    }
}

/// Applies a counter's scale factor and truncates toward zero.
pub fn scale_value(raw: u64, scale: f64) -> f64 {
    (raw as f64 * scale).trunc()
}
