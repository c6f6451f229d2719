//! Fee estimation for composed transactions
//!
//! Sizes are P2WPKH virtual bytes: 10 vB of overhead, 68 vB per input and
//! 34 vB per output.

pub const TX_OVERHEAD_VB: u64 = 10;
pub const INPUT_VB: u64 = 68;
pub const OUTPUT_VB: u64 = 34;

/// Outputs below this value are not created; the amount goes to fees
pub const DUST_LIMIT: u64 = 546;

pub trait FeeEstimator: Send + Sync {
    fn estimate_fee(&self, num_inputs: usize, num_outputs: usize) -> u64;
}

/// Constant sat/vB rate
#[derive(Clone, Copy, Debug)]
pub struct FixedFeeEstimator {
    pub fee_rate_sat_vb: u64,
}

impl FixedFeeEstimator {
    pub fn new(fee_rate_sat_vb: u64) -> Self {
        Self { fee_rate_sat_vb }
    }
}

/// Estimate transaction size in virtual bytes based on number of inputs and outputs
pub fn estimate_tx_size(num_inputs: usize, num_outputs: usize) -> u64 {
    TX_OVERHEAD_VB + num_inputs as u64 * INPUT_VB + num_outputs as u64 * OUTPUT_VB
}

impl FeeEstimator for FixedFeeEstimator {
    fn estimate_fee(&self, num_inputs: usize, num_outputs: usize) -> u64 {
        estimate_tx_size(num_inputs, num_outputs) * self.fee_rate_sat_vb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_rate_scales_with_size() {
        let estimator = FixedFeeEstimator::new(2);
        assert_eq!(estimator.estimate_fee(1, 2), (10 + 68 + 68) * 2);
        assert_eq!(estimator.estimate_fee(3, 1), (10 + 204 + 34) * 2);
    }
}
