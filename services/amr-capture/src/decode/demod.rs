//! Magnitude computation for IQ samples
//!
//! rtl_tcp delivers 8-bit unsigned IQ pairs centered near 127.4. The decoder only
//! needs signal envelope, so each pair is mapped through a 64K lookup table.

/// DC offset of the RTL2832U 8-bit samples
const DC_OFFSET: f32 = 127.4;

/// Pre-computed magnitude lookup table
/// Index: (I << 8) | Q where I, Q are 0-255
pub struct MagnitudeTable {
    table: Vec<f32>,
    fast: bool,
}

impl MagnitudeTable {
    /// Build the table.
    ///
    /// With `fast` set, uses the alpha-max-plus-beta-min approximation
    /// `max(|I|, |Q|) + 0.4 * min(|I|, |Q|)`; otherwise the exact euclidean norm.
    pub fn new(fast: bool) -> Self {
        let mut table = vec![0f32; 256 * 256];

        for i in 0..256usize {
            for q in 0..256usize {
                let ai = (i as f32 - DC_OFFSET).abs();
                let aq = (q as f32 - DC_OFFSET).abs();

                table[(i << 8) | q] = if fast {
                    ai.max(aq) + 0.4 * ai.min(aq)
                } else {
                    (ai * ai + aq * aq).sqrt()
                };
            }
        }

        Self { table, fast }
    }

    pub fn is_fast(&self) -> bool {
        self.fast
    }

    /// Convert IQ sample pair to magnitude
    #[inline(always)]
    pub fn magnitude(&self, i: u8, q: u8) -> f32 {
        self.table[((i as usize) << 8) | (q as usize)]
    }

    /// Convert a buffer of IQ samples to magnitudes
    /// Input: pairs of (I, Q) bytes
    pub fn compute_magnitudes(&self, iq_data: &[u8], output: &mut [f32]) {
        for (out, pair) in output.iter_mut().zip(iq_data.chunks_exact(2)) {
            *out = self.magnitude(pair[0], pair[1]);
        }
    }
}
