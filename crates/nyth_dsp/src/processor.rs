//! Audio Processor Trait
//!
//! Common interface for whole-block stages so pipelines can be assembled
//! from parts (EQ -> effects -> noise reduction -> custom stages).

use crate::buffer::AudioBuffer;
use crate::effects::EffectChain;
use crate::eq::Equalizer;
use crate::noise::NoiseManager;

/// Stream format handed to every stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessContext {
    pub sample_rate: f32,
    pub channels: usize,
    pub block_size: usize,
}

impl ProcessContext {
    pub fn new(sample_rate: f32, channels: usize, block_size: usize) -> Self {
        Self {
            sample_rate,
            channels,
            block_size,
        }
    }
}

/// A stage that transforms an [`AudioBuffer`] in place
///
/// `process` runs on the audio thread: it must not allocate, lock or do I/O,
/// and its cost must stay linear in the block length. Size any state in the
/// constructor or in `reset`.
pub trait AudioProcessor: Send {
    fn process(&mut self, buffer: &mut AudioBuffer, context: &ProcessContext);

    /// Clear filter memory and envelopes
    fn reset(&mut self);

    fn name(&self) -> &'static str;

    fn is_enabled(&self) -> bool {
        true
    }

    /// Samples of delay this stage adds
    fn latency_samples(&self) -> usize {
        0
    }
}

/// Processors applied in insertion order
pub struct ProcessorChain {
    processors: Vec<Box<dyn AudioProcessor>>,
    context: ProcessContext,
}

impl ProcessorChain {
    pub fn new(context: ProcessContext) -> Self {
        Self {
            processors: Vec::new(),
            context,
        }
    }

    /// Append a stage; allocates, so keep it off the audio thread
    pub fn add(&mut self, processor: Box<dyn AudioProcessor>) {
        self.processors.push(processor);
    }

    /// Remove the first processor named `name`
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn AudioProcessor>> {
        let index = self.processors.iter().position(|p| p.name() == name)?;
        Some(self.processors.remove(index))
    }

    #[inline]
    pub fn process(&mut self, buffer: &mut AudioBuffer) {
        for processor in &mut self.processors {
            if processor.is_enabled() {
                processor.process(buffer, &self.context);
            }
        }
    }

    pub fn reset(&mut self) {
        for processor in &mut self.processors {
            processor.reset();
        }
    }

    pub fn context(&self) -> ProcessContext {
        self.context
    }

    pub fn set_context(&mut self, context: ProcessContext) {
        self.context = context;
    }

    pub fn latency_samples(&self) -> usize {
        self.processors
            .iter()
            .filter(|p| p.is_enabled())
            .map(|p| p.latency_samples())
            .sum()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl AudioProcessor for Equalizer {
    fn process(&mut self, buffer: &mut AudioBuffer, _context: &ProcessContext) {
        self.process_buffer(buffer);
    }

    fn reset(&mut self) {
        Equalizer::reset(self);
    }

    fn name(&self) -> &'static str {
        "Equalizer"
    }

    fn is_enabled(&self) -> bool {
        !self.is_bypassed()
    }
}

impl AudioProcessor for EffectChain {
    fn process(&mut self, buffer: &mut AudioBuffer, _context: &ProcessContext) {
        self.process_buffer(buffer);
    }

    fn reset(&mut self) {
        EffectChain::reset(self);
    }

    fn name(&self) -> &'static str {
        "Effect Chain"
    }

    fn is_enabled(&self) -> bool {
        EffectChain::is_enabled(self)
    }

    fn latency_samples(&self) -> usize {
        EffectChain::latency_samples(self)
    }
}

impl AudioProcessor for NoiseManager {
    fn process(&mut self, buffer: &mut AudioBuffer, _context: &ProcessContext) {
        self.process_buffer(buffer);
    }

    fn reset(&mut self) {
        NoiseManager::reset(self);
    }

    fn name(&self) -> &'static str {
        "Noise Reduction"
    }

    fn is_enabled(&self) -> bool {
        self.is_processing()
    }

    fn latency_samples(&self) -> usize {
        NoiseManager::latency_samples(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Polarity;

    impl AudioProcessor for Polarity {
        fn process(&mut self, buffer: &mut AudioBuffer, _context: &ProcessContext) {
            buffer.apply_gain(-1.0);
        }

        fn reset(&mut self) {}

        fn name(&self) -> &'static str {
            "Polarity"
        }
    }

    fn context() -> ProcessContext {
        ProcessContext::new(48000.0, 2, 512)
    }

    fn stereo(left: f32, right: f32) -> AudioBuffer {
        let mut buffer = AudioBuffer::new(2, 1);
        buffer.copy_from_slice(0, &[left]);
        buffer.copy_from_slice(1, &[right]);
        buffer
    }

    #[test]
    fn test_empty_chain() {
        let mut chain = ProcessorChain::new(context());
        assert!(chain.is_empty());
        let mut buffer = stereo(0.5, -0.5);
        chain.process(&mut buffer);
        assert_eq!(buffer.channel(0), &[0.5]);
        assert_eq!(buffer.channel(1), &[-0.5]);
    }

    #[test]
    fn test_stages_run_in_insertion_order() {
        let mut chain = ProcessorChain::new(context());
        chain.add(Box::new(Polarity));
        let mut buffer = stereo(0.5, -0.5);
        chain.process(&mut buffer);
        assert_eq!(buffer.channel(0), &[-0.5]);

        // A second flip restores the input polarity
        chain.add(Box::new(Polarity));
        chain.process(&mut buffer);
        assert_eq!(buffer.channel(0), &[-0.5]);
        assert_eq!(chain.names(), vec!["Polarity", "Polarity"]);
    }

    #[test]
    fn test_bypassed_eq_is_skipped() {
        let mut chain = ProcessorChain::new(context());
        let mut eq = Equalizer::new(48000.0).unwrap();
        eq.set_band_gain(0, 12.0).unwrap();
        eq.set_bypass(true);
        chain.add(Box::new(eq));

        let mut buffer = AudioBuffer::new(2, 64);
        buffer.channel_mut(0).fill(0.25);
        chain.process(&mut buffer);
        assert!(buffer.channel(0).iter().all(|&s| s == 0.25));
    }

    #[test]
    fn test_stages_in_chain() {
        let mut chain = ProcessorChain::new(context());
        chain.add(Box::new(Equalizer::new(48000.0).unwrap()));
        chain.add(Box::new(EffectChain::new(48000.0, 2).unwrap()));
        chain.add(Box::new(NoiseManager::new()));
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.latency_samples(), 0);

        let mut buffer = AudioBuffer::new(2, 256);
        buffer.channel_mut(0).fill(0.5);
        chain.process(&mut buffer);
        assert!(!buffer.has_non_finite());

        chain.reset();
        assert!(chain.remove("Effect Chain").is_some());
        assert!(chain.remove("Effect Chain").is_none());
        assert_eq!(chain.names(), vec!["Equalizer", "Noise Reduction"]);
    }

    #[test]
    fn test_context_replacement() {
        let mut chain = ProcessorChain::new(context());
        assert_eq!(chain.context().block_size, 512);
        chain.set_context(ProcessContext::new(44100.0, 1, 128));
        assert_eq!(chain.context().channels, 1);
    }
}
