// TRANSACTION LIFECYCLE - SIGNING CAPABILITY
// Handles: opaque transaction signing via a remote key manager or a local dev wallet

use async_trait::async_trait;
use ethers::{
    signers::{LocalWallet, Signer},
    types::transaction::eip2718::TypedTransaction,
};
use serde::Serialize;
use std::{str::FromStr, time::Duration};
use tracing::info;

use crate::{chain::to_transaction_request, error::TxError, types::TxParams};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedTransaction {
    pub chain_id: u64,
    #[serde(flatten)]
    pub params: TxParams,
}

/// Returns the signed, serialized transaction as `0x` hex. Key material never
/// crosses this interface.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    async fn sign_transaction(&self, tx: &UnsignedTransaction) -> Result<String, TxError>;
}

// ============================================================================
// REMOTE KEY MANAGER
// ============================================================================

pub struct RemoteKeyManagerSigner {
    client: reqwest::Client,
    key_manager_url: String,
    key_id: String,
}

impl RemoteKeyManagerSigner {
    pub fn new(key_manager_url: impl Into<String>, key_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            key_manager_url: key_manager_url.into(),
            key_id: key_id.into(),
        }
    }
}

#[async_trait]
impl TransactionSigner for RemoteKeyManagerSigner {
    async fn sign_transaction(&self, tx: &UnsignedTransaction) -> Result<String, TxError> {
        let url = format!(
            "{}/key/{}/sign/transaction",
            self.key_manager_url, self.key_id
        );

        let response = self
            .client
            .post(&url)
            .json(tx)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| TxError::Signing(format!("Key manager unreachable: {}", e)))?;

        let sign_result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TxError::Signing(format!("Invalid sign response: {}", e)))?;

        let signed_tx = sign_result["signedTransaction"]
            .as_str()
            .ok_or_else(|| TxError::Signing("No signed transaction in response".to_string()))?;

        Ok(format!("0x{}", signed_tx.trim_start_matches("0x")))
    }
}

// ============================================================================
// LOCAL WALLET
// ============================================================================

pub struct LocalWalletSigner {
    wallet: LocalWallet,
}

impl LocalWalletSigner {
    pub fn from_private_key(private_key: &str) -> Result<Self, TxError> {
        let wallet = LocalWallet::from_str(private_key.trim_start_matches("0x"))
            .map_err(|e| TxError::Signing(format!("Invalid private key: {}", e)))?;
        info!("[SIGNER] Local wallet loaded for {:?}", wallet.address());
        Ok(Self { wallet })
    }

    pub fn address(&self) -> String {
        format!("{:?}", self.wallet.address())
    }
}

#[async_trait]
impl TransactionSigner for LocalWalletSigner {
    async fn sign_transaction(&self, tx: &UnsignedTransaction) -> Result<String, TxError> {
        let mut typed: TypedTransaction = to_transaction_request(&tx.params)?.into();

        let signature = if tx.chain_id == 0 {
            // No replay protection: chain id stays out of the sighash, v is 27/28.
            self.wallet
                .sign_hash(typed.sighash())
                .map_err(|e| TxError::Signing(e.to_string()))?
        } else {
            typed.set_chain_id(tx.chain_id);
            self.wallet
                .clone()
                .with_chain_id(tx.chain_id)
                .sign_transaction(&typed)
                .await
                .map_err(|e| TxError::Signing(e.to_string()))?
        };

        Ok(format!("0x{}", hex::encode(typed.rlp_signed(&signature))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV_KEY: &str = "8718b9618a37d1fc78c436511fc6df3c8258d3250635bba617f33003270ec03e";

    #[test]
    fn unsigned_payload_flattens_params() {
        let tx = UnsignedTransaction {
            chain_id: 42,
            params: TxParams {
                from: "0x1678a085c290ebd122dc42cba69373b5953b831d".to_string(),
                nonce: Some("0x1".to_string()),
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["chainId"], 42);
        assert_eq!(json["from"], "0x1678a085c290ebd122dc42cba69373b5953b831d");
        assert_eq!(json["nonce"], "0x1");
    }

    #[tokio::test]
    async fn local_wallet_produces_hex_payload() {
        let signer = LocalWalletSigner::from_private_key(DEV_KEY).unwrap();
        let tx = UnsignedTransaction {
            chain_id: 42,
            params: TxParams {
                from: signer.address(),
                to: Some("0xc684832530fcbddae4b4230a47e991ddcec2831d".to_string()),
                value: Some("0x0".to_string()),
                gas: Some("0x5208".to_string()),
                gas_price: Some("0x4a817c800".to_string()),
                nonce: Some("0x0".to_string()),
                data: None,
            },
        };

        let raw = signer.sign_transaction(&tx).await.unwrap();
        assert!(raw.starts_with("0x"));
        assert!(raw.len() > 100);
        assert!(hex::decode(&raw[2..]).is_ok());
    }

    fn legacy_transfer(from: String, chain_id: u64) -> UnsignedTransaction {
        UnsignedTransaction {
            chain_id,
            params: TxParams {
                from,
                to: Some("0xc684832530fcbddae4b4230a47e991ddcec2831d".to_string()),
                value: Some("0x0".to_string()),
                gas: Some("0x5208".to_string()),
                gas_price: Some("0x4a817c800".to_string()),
                nonce: Some("0x0".to_string()),
                data: None,
            },
        }
    }

    fn signed_v(raw: &str) -> u64 {
        let bytes = hex::decode(&raw[2..]).unwrap();
        ethers::utils::rlp::Rlp::new(&bytes).val_at::<u64>(6).unwrap()
    }

    #[tokio::test]
    async fn chain_id_zero_signs_without_replay_protection() {
        let signer = LocalWalletSigner::from_private_key(DEV_KEY).unwrap();

        let raw = signer
            .sign_transaction(&legacy_transfer(signer.address(), 0))
            .await
            .unwrap();
        assert!(matches!(signed_v(&raw), 27 | 28));

        let raw = signer
            .sign_transaction(&legacy_transfer(signer.address(), 42))
            .await
            .unwrap();
        // EIP-155: v = chain_id * 2 + 35 or 36
        assert!(matches!(signed_v(&raw), 119 | 120));
    }

    #[test]
    fn rejects_malformed_private_key() {
        assert!(matches!(
            LocalWalletSigner::from_private_key("xyz"),
            Err(TxError::Signing(_))
        ));
    }
}
