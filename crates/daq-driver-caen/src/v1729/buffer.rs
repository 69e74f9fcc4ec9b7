//! Circular buffer decoding.
//!
//! The V1729 writes continuously into a circular analog memory and stops a
//! fixed number of columns after the trigger. The trigger record and the
//! verniers in the header locate the end of the acquisition inside that
//! memory; [`DigitizerBuffer`] unfolds it so that sample 0 of every channel
//! is the oldest trustworthy sample.
//!
//! Physical layout of data row `r` (channels stored in descending order):
//!
//! ```text
//! word = MEMORY_HEADER_SIZE + r * N_CHANNELS + (N_CHANNELS - 1 - channel)
//! ```

use std::iter::FusedIterator;
use std::ops::Range;
use std::sync::Arc;

use vme_core::{Result, VmeError};

use super::calibration::DigitizerCalibration;
use super::spec::{
    Submodel, MEMORY_HEADER_SIZE, MEMORY_SIZE, MEMORY_VERNIER_INDEX, N_CELLS, N_CHANNELS, N_ROWS,
    ROWS_PER_CELL, SAMPLES_PER_CHANNEL, SKIP_ROWS,
};

/// Unpack block words of `word_bytes` bytes into 16 bit samples.
///
/// Samples are taken little-endian from each word. Returns the number of
/// samples written, bounded by `out.len()`.
pub fn unpack_words(words: &[u64], word_bytes: usize, out: &mut [u16]) -> usize {
    let per_word = (word_bytes / 2).max(1);
    let mut written = 0;
    for word in words {
        for k in 0..per_word {
            let Some(slot) = out.get_mut(written) else {
                return written;
            };
            *slot = (word >> (16 * k)) as u16;
            written += 1;
        }
    }
    written
}

/// Pack 16 bit samples into block words of `word_bytes` bytes.
pub fn pack_words(samples: &[u16], word_bytes: usize) -> Vec<u64> {
    let per_word = (word_bytes / 2).max(1);
    samples
        .chunks(per_word)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u64, |word, (k, &sample)| word | (u64::from(sample) << (16 * k)))
        })
        .collect()
}

#[derive(Debug, Clone)]
struct Decoded {
    calibration: Arc<DigitizerCalibration>,
    trig_rec: u16,
    end: i64,
}

/// One raw memory snapshot with its decoding state.
#[derive(Debug, Clone)]
pub struct DigitizerBuffer {
    raw: Vec<u16>,
    mask: u16,
    decoded: Option<Decoded>,
}

impl DigitizerBuffer {
    /// Empty buffer for a board of `submodel`.
    pub fn new(submodel: Submodel) -> Self {
        Self {
            raw: vec![0; MEMORY_SIZE],
            mask: submodel.memory_mask(),
            decoded: None,
        }
    }

    /// Raw memory words as read from the board.
    pub fn raw(&self) -> &[u16] {
        &self.raw
    }

    /// Mutable raw memory. Any previous decoding is discarded.
    pub fn raw_mut(&mut self) -> &mut [u16] {
        self.decoded = None;
        &mut self.raw
    }

    /// Whether [`calibrate`](Self::calibrate) ran on the current contents.
    pub fn is_calibrated(&self) -> bool {
        self.decoded.is_some()
    }

    /// Trigger record of the decoded acquisition.
    pub fn trig_rec(&self) -> Option<u16> {
        self.decoded.as_ref().map(|d| d.trig_rec)
    }

    /// Row index at which the acquisition ended, before wrapping.
    pub fn buffer_end(&self) -> Option<i64> {
        self.decoded.as_ref().map(|d| d.end)
    }

    /// Locate the acquisition inside the circular memory.
    ///
    /// `end = (N_CELLS - (trig_rec - post_trig)) * ROWS_PER_CELL - vernier`
    pub fn calibrate(&mut self, calibration: Arc<DigitizerCalibration>, trig_rec: u16) -> Result<()> {
        calibration.validate()?;
        let vernier = self.vernier_offset(&calibration);
        let cells = N_CELLS as i64 - (i64::from(trig_rec) - i64::from(calibration.post_trig));
        let end = cells * ROWS_PER_CELL as i64 - vernier;
        self.decoded = Some(Decoded {
            calibration,
            trig_rec,
            end,
        });
        Ok(())
    }

    /// Sub-cell alignment in rows, averaged over all channels.
    ///
    /// Header word `MEMORY_VERNIER_INDEX + k` holds the vernier of channel
    /// `N_CHANNELS - 1 - k`.
    pub fn vernier_offset(&self, calibration: &DigitizerCalibration) -> i64 {
        let sum: f64 = (0..N_CHANNELS)
            .map(|k| {
                let channel = N_CHANNELS - 1 - k;
                let value = f64::from(self.raw[MEMORY_VERNIER_INDEX + k]);
                let min = f64::from(calibration.vernier_min[channel]);
                let max = f64::from(calibration.vernier_max[channel]);
                (value - min) / (max - min)
            })
            .sum();
        (ROWS_PER_CELL as f64 * sum / N_CHANNELS as f64) as i64
    }

    /// Samples per channel.
    pub const fn len(&self) -> usize {
        SAMPLES_PER_CHANNEL
    }

    /// Always false; every channel has [`SAMPLES_PER_CHANNEL`] samples.
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Physical word index of sample `index` of `channel`.
    pub fn fold_index(&self, channel: usize, index: usize) -> Result<usize> {
        let decoded = self.decoded()?;
        check_channel(channel)?;
        check_index(index)?;
        Ok(fold(decoded.end, channel, index))
    }

    /// Pedestal-subtracted sample `index` of `channel`.
    pub fn get(&self, channel: usize, index: usize) -> Result<i32> {
        self.channel(channel)?.get(index)
    }

    /// Sum of the samples of `channel` over `range`.
    pub fn integrate(&self, channel: usize, range: Range<usize>) -> Result<i64> {
        self.channel(channel)?.integrate(range)
    }

    /// Sum over all samples of `channel`.
    pub fn integrate_all(&self, channel: usize) -> Result<i64> {
        self.integrate(channel, 0..SAMPLES_PER_CHANNEL)
    }

    /// Array-like view on one channel.
    pub fn channel(&self, channel: usize) -> Result<ChannelView<'_>> {
        let decoded = self.decoded()?;
        check_channel(channel)?;
        Ok(ChannelView {
            raw: &self.raw,
            mask: self.mask,
            pedestal: &decoded.calibration.pedestal,
            end: decoded.end,
            channel,
        })
    }

    fn decoded(&self) -> Result<&Decoded> {
        self.decoded.as_ref().ok_or(VmeError::NotCalibrated)
    }
}

fn check_channel(channel: usize) -> Result<()> {
    if channel < N_CHANNELS {
        Ok(())
    } else {
        Err(VmeError::ChannelOutOfRange {
            channel,
            max: N_CHANNELS,
        })
    }
}

fn check_index(index: usize) -> Result<()> {
    if index < SAMPLES_PER_CHANNEL {
        Ok(())
    } else {
        Err(VmeError::IndexOutOfRange {
            index,
            len: SAMPLES_PER_CHANNEL,
        })
    }
}

fn fold(end: i64, channel: usize, index: usize) -> usize {
    let row = (end + (SKIP_ROWS + index + 1) as i64).rem_euclid(N_ROWS as i64) as usize;
    MEMORY_HEADER_SIZE + row * N_CHANNELS + (N_CHANNELS - 1 - channel)
}

/// Read-only view on one decoded channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelView<'a> {
    raw: &'a [u16],
    mask: u16,
    pedestal: &'a [u16],
    end: i64,
    channel: usize,
}

impl<'a> ChannelView<'a> {
    /// Channel number.
    pub fn channel_number(&self) -> usize {
        self.channel
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        SAMPLES_PER_CHANNEL
    }

    /// Always false.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Sample at `index`.
    pub fn get(&self, index: usize) -> Result<i32> {
        check_index(index)?;
        Ok(self.sample(index))
    }

    /// Sum of the samples in `range`.
    pub fn integrate(&self, range: Range<usize>) -> Result<i64> {
        if range.end > SAMPLES_PER_CHANNEL {
            return Err(VmeError::IndexOutOfRange {
                index: range.end,
                len: SAMPLES_PER_CHANNEL,
            });
        }
        Ok(range.map(|i| i64::from(self.sample(i))).sum())
    }

    /// Iterator over all samples in order.
    pub fn iter(&self) -> ChannelIter<'a> {
        ChannelIter {
            view: *self,
            front: 0,
            back: SAMPLES_PER_CHANNEL,
        }
    }

    fn sample(&self, index: usize) -> i32 {
        let word = fold(self.end, self.channel, index);
        i32::from(self.raw[word] & self.mask) - i32::from(self.pedestal[word])
    }
}

impl<'a> IntoIterator for ChannelView<'a> {
    type Item = i32;
    type IntoIter = ChannelIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the samples of a [`ChannelView`].
#[derive(Debug, Clone)]
pub struct ChannelIter<'a> {
    view: ChannelView<'a>,
    front: usize,
    back: usize,
}

impl Iterator for ChannelIter<'_> {
    type Item = i32;

    fn next(&mut self) -> Option<i32> {
        if self.front >= self.back {
            return None;
        }
        let value = self.view.sample(self.front);
        self.front += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }

    fn nth(&mut self, n: usize) -> Option<i32> {
        self.front = self.front.saturating_add(n).min(self.back);
        self.next()
    }
}

impl DoubleEndedIterator for ChannelIter<'_> {
    fn next_back(&mut self) -> Option<i32> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        Some(self.view.sample(self.back))
    }
}

impl ExactSizeIterator for ChannelIter<'_> {}
impl FusedIterator for ChannelIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn calibration(post_trig: u16) -> Arc<DigitizerCalibration> {
        Arc::new(
            DigitizerCalibration::new(vec![0; MEMORY_SIZE], [100; 4], [300; 4])
                .unwrap()
                .with_post_trig(post_trig),
        )
    }

    fn buffer_with_verniers(verniers: [u16; 4]) -> DigitizerBuffer {
        let mut buffer = DigitizerBuffer::new(Submodel::V1729A);
        buffer.raw_mut()[MEMORY_VERNIER_INDEX..MEMORY_VERNIER_INDEX + 4].copy_from_slice(&verniers);
        buffer
    }

    #[test]
    fn test_unpack_little_endian() {
        let mut out = [0u16; 8];
        let n = unpack_words(&[0x0004_0003_0002_0001, 0x0008_0007_0006_0005], 8, &mut out);
        assert_eq!(n, 8);
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);

        let mut out = [0u16; 3];
        assert_eq!(unpack_words(&[0x0002_0001, 0x0004_0003], 4, &mut out), 3);
        assert_eq!(out, [1, 2, 3]);

        assert_eq!(pack_words(&[1, 2, 3, 4, 5], 8), vec![0x0004_0003_0002_0001, 5]);
    }

    #[test]
    fn test_uncalibrated_access_fails() {
        let buffer = DigitizerBuffer::new(Submodel::V1729);
        assert!(matches!(buffer.get(0, 0), Err(VmeError::NotCalibrated)));
        assert!(matches!(buffer.integrate_all(1), Err(VmeError::NotCalibrated)));
        assert!(buffer.channel(2).is_err());
        assert!(buffer.buffer_end().is_none());
    }

    #[test]
    fn test_buffer_end_formula() {
        // verniers at the middle of their range: offset = 20 * 2.0 / 4 = 10
        let mut buffer = buffer_with_verniers([200; 4]);
        buffer.calibrate(calibration(30), 40).unwrap();
        assert_eq!(buffer.buffer_end(), Some((128 - (40 - 30)) * 20 - 10));

        // verniers at the minimum
        let mut buffer = buffer_with_verniers([100; 4]);
        buffer.calibrate(calibration(0), 128).unwrap();
        assert_eq!(buffer.buffer_end(), Some(0));
    }

    #[test]
    fn test_calibrate_is_deterministic() {
        let mut a = buffer_with_verniers([150, 220, 180, 290]);
        let mut b = a.clone();
        a.calibrate(calibration(12), 77).unwrap();
        b.calibrate(calibration(12), 77).unwrap();
        assert_eq!(a.buffer_end(), b.buffer_end());
        a.calibrate(calibration(12), 77).unwrap();
        assert_eq!(a.buffer_end(), b.buffer_end());
    }

    #[test]
    fn test_fold_visits_each_cell_once() {
        for trig_rec in [0u16, 5, 64, 127, 200] {
            let mut buffer = buffer_with_verniers([170, 230, 110, 299]);
            buffer.calibrate(calibration(9), trig_rec).unwrap();
            let mut seen = HashSet::new();
            for channel in 0..N_CHANNELS {
                for index in 0..SAMPLES_PER_CHANNEL {
                    let word = buffer.fold_index(channel, index).unwrap();
                    assert!((MEMORY_HEADER_SIZE..MEMORY_SIZE).contains(&word));
                    assert!(seen.insert(word), "word {word} visited twice");
                }
            }
            assert_eq!(seen.len(), N_CHANNELS * SAMPLES_PER_CHANNEL);
        }
    }

    #[test]
    fn test_channels_reversed_within_row() {
        let mut buffer = buffer_with_verniers([100; 4]);
        buffer.calibrate(calibration(0), 128).unwrap();
        let row_start = buffer.fold_index(3, 0).unwrap();
        assert_eq!(buffer.fold_index(2, 0).unwrap(), row_start + 1);
        assert_eq!(buffer.fold_index(0, 0).unwrap(), row_start + 3);
        // end = 0, first trusted row is SKIP_ROWS + 1
        assert_eq!(row_start, MEMORY_HEADER_SIZE + (SKIP_ROWS + 1) * N_CHANNELS);
    }

    #[test]
    fn test_pedestal_subtraction_and_mask() {
        let mut buffer = buffer_with_verniers([100; 4]);
        for word in buffer.raw_mut()[MEMORY_HEADER_SIZE..].iter_mut() {
            // bits above the 14 bit mask must be ignored
            *word = 0xC000 | 1000;
        }
        let mut pedestal = vec![0; MEMORY_SIZE];
        pedestal[MEMORY_HEADER_SIZE..].fill(1010);
        let calibration =
            Arc::new(DigitizerCalibration::new(pedestal, [100; 4], [300; 4]).unwrap());
        buffer.calibrate(calibration, 0).unwrap();

        assert_eq!(buffer.get(1, 17).unwrap(), -10);
        assert_eq!(buffer.integrate(1, 0..100).unwrap(), -1000);
        assert_eq!(
            buffer.integrate_all(3).unwrap(),
            -10 * SAMPLES_PER_CHANNEL as i64
        );
    }

    #[test]
    fn test_channel_view() {
        let mut buffer = buffer_with_verniers([100; 4]);
        for (i, word) in buffer.raw_mut().iter_mut().enumerate() {
            *word = (i % 4000) as u16;
        }
        buffer.calibrate(calibration(0), 3).unwrap();

        let view = buffer.channel(2).unwrap();
        assert_eq!(view.len(), SAMPLES_PER_CHANNEL);
        assert_eq!(view.iter().len(), SAMPLES_PER_CHANNEL);
        let samples: Vec<i32> = view.iter().collect();
        for (i, sample) in samples.iter().enumerate().step_by(97) {
            assert_eq!(*sample, buffer.get(2, i).unwrap());
        }
        assert_eq!(view.iter().rev().next(), samples.last().copied());
        assert_eq!(
            view.integrate(10..20).unwrap(),
            samples[10..20].iter().map(|&s| i64::from(s)).sum::<i64>()
        );
    }

    #[test]
    fn test_out_of_range() {
        let mut buffer = buffer_with_verniers([100; 4]);
        buffer.calibrate(calibration(0), 0).unwrap();
        assert!(matches!(
            buffer.get(4, 0),
            Err(VmeError::ChannelOutOfRange { channel: 4, max: 4 })
        ));
        assert!(matches!(
            buffer.get(0, SAMPLES_PER_CHANNEL),
            Err(VmeError::IndexOutOfRange { .. })
        ));
        assert!(buffer.integrate(0, 0..SAMPLES_PER_CHANNEL + 1).is_err());
    }

    #[test]
    fn test_new_data_discards_decoding() {
        let mut buffer = buffer_with_verniers([100; 4]);
        buffer.calibrate(calibration(0), 0).unwrap();
        assert!(buffer.is_calibrated());
        buffer.raw_mut()[20] = 5;
        assert!(!buffer.is_calibrated());
    }
}
