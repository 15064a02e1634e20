// TRANSACTION LIFECYCLE - GAS ESTIMATION SERVICE
// Handles: gas estimation against the block ceiling, simulation failure detection, safety buffer

use ethers::types::U256;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    chain::{BlockTag, ChainQuery},
    error::TxError,
    hex_quantity::{parse_chain_quantity, parse_optional_quantity, to_quantity},
    types::TxParams,
};

pub const DEFAULT_GAS_BUFFER: u64 = 100_000;
pub const SIMPLE_SEND_GAS: u64 = 21_000;

const OP_DELEGATECALL: u8 = 0xf4;
const OP_PUSH1: u8 = 0x60;
const OP_PUSH32: u8 = 0x7f;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasAnalysis {
    /// Raw node estimate, executed with the block gas limit as ceiling.
    pub estimated_gas: U256,
    pub gas_limit_specified: bool,
    pub simulation_fails: bool,
    /// Gas limit to put on the transaction.
    pub gas: U256,
}

pub struct GasEstimator {
    chain: Arc<dyn ChainQuery>,
    gas_buffer: U256,
}

impl GasEstimator {
    pub fn new(chain: Arc<dyn ChainQuery>, gas_buffer: U256) -> Self {
        Self { chain, gas_buffer }
    }

    pub async fn latest_block_gas_limit(&self) -> Result<U256, TxError> {
        let block = self.chain.get_block_by_number(BlockTag::Latest).await?;
        parse_chain_quantity("gasLimit", &block.gas_limit)
    }

    /// Estimates against the latest block's gas limit.
    pub async fn analyze_gas_usage(&self, params: &TxParams) -> Result<GasAnalysis, TxError> {
        let block_gas_limit = self.latest_block_gas_limit().await?;
        self.estimate(params, block_gas_limit).await
    }

    pub async fn estimate(
        &self,
        params: &TxParams,
        block_gas_limit: U256,
    ) -> Result<GasAnalysis, TxError> {
        let specified = parse_optional_quantity("gas", params.gas.as_deref())?;

        // Estimate with the block ceiling so a low caller gas cannot OOG the probe.
        let mut probe = params.clone();
        probe.gas = Some(to_quantity(block_gas_limit));

        let estimate_hex = self.chain.estimate_gas(&probe).await?;
        let estimated_gas = parse_chain_quantity("estimatedGas", &estimate_hex)?;
        let simulation_fails = estimated_gas == block_gas_limit;

        if simulation_fails {
            warn!(
                "[GAS] Simulation for {} consumed the whole ceiling {}",
                params.from, block_gas_limit
            );
        }

        let gas = select_gas_limit(
            estimated_gas,
            specified,
            simulation_fails,
            block_gas_limit,
            self.gas_buffer,
        );

        debug!(
            "[GAS] estimate={} specified={:?} limit={} -> gas={}",
            estimated_gas, specified, block_gas_limit, gas
        );

        Ok(GasAnalysis {
            estimated_gas,
            gas_limit_specified: specified.is_some(),
            simulation_fails,
            gas,
        })
    }

    /// Advisory only: any failure to fetch code means no warning.
    pub async fn check_delegate_call(&self, params: &TxParams) -> bool {
        let Some(to) = params.to.as_deref() else {
            return false;
        };

        match self.chain.get_code(to).await {
            Ok(code) if !code.is_empty() => {
                let found = contains_delegate_call(&code);
                if found {
                    info!("[GAS] Target {} contains DELEGATECALL", to);
                }
                found
            }
            Ok(_) => false,
            Err(e) => {
                debug!("[GAS] Could not fetch code for {}: {}", to, e);
                false
            }
        }
    }
}

/// Caller-specified gas wins; a failing simulation gets no buffer; otherwise
/// the buffered estimate is used if it fits under the block limit.
pub fn select_gas_limit(
    estimated_gas: U256,
    specified: Option<U256>,
    simulation_fails: bool,
    block_gas_limit: U256,
    gas_buffer: U256,
) -> U256 {
    if simulation_fails {
        return specified.unwrap_or(block_gas_limit);
    }
    if let Some(gas) = specified {
        return gas;
    }
    add_gas_buffer(estimated_gas, gas_buffer, block_gas_limit)
}

pub fn add_gas_buffer(estimated_gas: U256, gas_buffer: U256, block_gas_limit: U256) -> U256 {
    match estimated_gas.checked_add(gas_buffer) {
        Some(buffered) if buffered <= block_gas_limit => buffered,
        _ => estimated_gas,
    }
}

pub fn contains_delegate_call(code: &[u8]) -> bool {
    let mut pc = 0;
    while pc < code.len() {
        let op = code[pc];
        if op == OP_DELEGATECALL {
            return true;
        }
        if (OP_PUSH1..=OP_PUSH32).contains(&op) {
            pc += (op - OP_PUSH1) as usize + 1;
        }
        pc += 1;
    }
    false
}
