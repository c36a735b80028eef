//! Decoded ledger data consumed by the index modules.
//!
//! Ledgers are stored as JSON by [`FsLedgerSource`](crate::FsLedgerSource). An
//! operation is an object with a `type` tag plus the fields of that type:
//!
//! ```json
//! { "source_account": "GA...", "type": "payment", "destination": "GB..." }
//! ```

use serde::{Deserialize, Serialize};

/// A closed ledger and its transactions in application order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCloseMeta {
    pub sequence: u32,
    #[serde(default)]
    pub transactions: Vec<LedgerTransaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// 1-based position of the transaction within its ledger.
    pub index: u32,
    #[serde(with = "hex::serde")]
    pub hash: [u8; 32],
    pub source_account: String,
    pub successful: bool,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Falls back to the transaction source when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_account: Option<String>,
    #[serde(flatten)]
    pub body: OperationBody,
}

impl Operation {
    pub fn new(body: OperationBody) -> Self {
        Self {
            source_account: None,
            body,
        }
    }

    pub fn with_source(source_account: impl Into<String>, body: OperationBody) -> Self {
        Self {
            source_account: Some(source_account.into()),
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationBody {
    CreateAccount {
        destination: String,
    },
    Payment {
        destination: String,
    },
    PathPaymentStrictReceive {
        destination: String,
    },
    PathPaymentStrictSend {
        destination: String,
    },
    ManageSellOffer,
    ManageBuyOffer,
    CreatePassiveSellOffer,
    SetOptions,
    ChangeTrust,
    AllowTrust {
        trustor: String,
    },
    AccountMerge {
        destination: String,
    },
    Inflation,
    ManageData,
    BumpSequence,
    CreateClaimableBalance {
        claimants: Vec<String>,
    },
    ClaimClaimableBalance,
    BeginSponsoringFutureReserves {
        sponsored_id: String,
    },
    EndSponsoringFutureReserves,
    RevokeSponsorship {
        target: RevokeSponsorshipTarget,
    },
    Clawback {
        from: String,
    },
    ClawbackClaimableBalance,
    SetTrustLineFlags {
        trustor: String,
    },
    LiquidityPoolDeposit,
    LiquidityPoolWithdraw,
    /// Any operation type this crate does not know how to index.
    #[serde(other)]
    Unknown,
}

impl OperationBody {
    /// Snake case name of the operation type, as used in the `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::CreateAccount { .. } => "create_account",
            Self::Payment { .. } => "payment",
            Self::PathPaymentStrictReceive { .. } => "path_payment_strict_receive",
            Self::PathPaymentStrictSend { .. } => "path_payment_strict_send",
            Self::ManageSellOffer => "manage_sell_offer",
            Self::ManageBuyOffer => "manage_buy_offer",
            Self::CreatePassiveSellOffer => "create_passive_sell_offer",
            Self::SetOptions => "set_options",
            Self::ChangeTrust => "change_trust",
            Self::AllowTrust { .. } => "allow_trust",
            Self::AccountMerge { .. } => "account_merge",
            Self::Inflation => "inflation",
            Self::ManageData => "manage_data",
            Self::BumpSequence => "bump_sequence",
            Self::CreateClaimableBalance { .. } => "create_claimable_balance",
            Self::ClaimClaimableBalance => "claim_claimable_balance",
            Self::BeginSponsoringFutureReserves { .. } => "begin_sponsoring_future_reserves",
            Self::EndSponsoringFutureReserves => "end_sponsoring_future_reserves",
            Self::RevokeSponsorship { .. } => "revoke_sponsorship",
            Self::Clawback { .. } => "clawback",
            Self::ClawbackClaimableBalance => "clawback_claimable_balance",
            Self::SetTrustLineFlags { .. } => "set_trust_line_flags",
            Self::LiquidityPoolDeposit => "liquidity_pool_deposit",
            Self::LiquidityPoolWithdraw => "liquidity_pool_withdraw",
            Self::Unknown => "unknown",
        }
    }
}

/// What a revoke sponsorship operation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RevokeSponsorshipTarget {
    LedgerEntry { key: LedgerKey },
    Signer { account_id: String, signer_key: String },
}

/// Key of a sponsored ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerKey {
    Account { account_id: String },
    Trustline { account_id: String },
    Offer { seller_id: String },
    Data { account_id: String },
    ClaimableBalance { balance_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ledger() {
        let json = r#"{
            "sequence": 100,
            "transactions": [{
                "index": 1,
                "hash": "0101010101010101010101010101010101010101010101010101010101010101",
                "source_account": "GSOURCE",
                "successful": true,
                "operations": [
                    { "type": "payment", "destination": "GDEST" },
                    { "type": "set_options", "source_account": "GOTHER" },
                    { "type": "invoke_host_function", "host_function": "whatever" },
                    {
                        "type": "revoke_sponsorship",
                        "target": { "kind": "ledger_entry", "key": { "type": "offer", "seller_id": "GSELLER" } }
                    }
                ]
            }]
        }"#;

        let ledger: LedgerCloseMeta = serde_json::from_str(json).unwrap();
        let tx = &ledger.transactions[0];

        assert_eq!(ledger.sequence, 100);
        assert_eq!(tx.hash, [1u8; 32]);
        assert_eq!(
            tx.operations,
            vec![
                Operation::new(OperationBody::Payment {
                    destination: "GDEST".to_string()
                }),
                Operation::with_source("GOTHER", OperationBody::SetOptions),
                Operation::new(OperationBody::Unknown),
                Operation::new(OperationBody::RevokeSponsorship {
                    target: RevokeSponsorshipTarget::LedgerEntry {
                        key: LedgerKey::Offer {
                            seller_id: "GSELLER".to_string()
                        }
                    }
                }),
            ]
        );
    }

    #[test]
    fn test_encode_ledger() {
        let ledger = LedgerCloseMeta {
            sequence: 7,
            transactions: vec![LedgerTransaction {
                index: 1,
                hash: [0xab; 32],
                source_account: "GA".to_string(),
                successful: false,
                operations: vec![Operation::new(OperationBody::Inflation)],
            }],
        };

        let json = serde_json::to_value(&ledger).unwrap();
        assert_eq!(json["transactions"][0]["hash"], "ab".repeat(32));
        assert_eq!(json["transactions"][0]["operations"][0]["type"], "inflation");

        let decoded: LedgerCloseMeta = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, ledger);
    }
}
