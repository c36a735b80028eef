//! Accounts taking part in a transaction, one rule per operation type.

use crate::ledger::{LedgerKey, LedgerTransaction, Operation, OperationBody, RevokeSponsorshipTarget};
use crate::{Error, Result};

/// Which operations contribute participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantPolicy {
    /// Every operation.
    AllOperations,
    /// Create account, payments, path payments and account merges only.
    PaymentsOnly,
}

/// Participants of every operation of `tx`, in operation order.
///
/// The result may contain duplicates. Fails on an unknown operation type.
pub fn transaction_participants(tx: &LedgerTransaction) -> Result<Vec<String>> {
    participants_for_operations(tx, ParticipantPolicy::AllOperations)
}

/// Participants of the payment-like operations of `tx`.
pub fn payment_participants(tx: &LedgerTransaction) -> Result<Vec<String>> {
    participants_for_operations(tx, ParticipantPolicy::PaymentsOnly)
}

pub fn participants_for_operations(
    tx: &LedgerTransaction,
    policy: ParticipantPolicy,
) -> Result<Vec<String>> {
    let mut participants = Vec::new();
    for (index, operation) in tx.operations.iter().enumerate() {
        participants.extend(participants_for_operation(tx, operation, index, policy)?);
    }
    Ok(participants)
}

fn is_payment(body: &OperationBody) -> bool {
    matches!(
        body,
        OperationBody::CreateAccount { .. }
            | OperationBody::Payment { .. }
            | OperationBody::PathPaymentStrictReceive { .. }
            | OperationBody::PathPaymentStrictSend { .. }
            | OperationBody::AccountMerge { .. }
    )
}

/// Participants of the operation at `index` within `tx`.
pub fn participants_for_operation(
    tx: &LedgerTransaction,
    operation: &Operation,
    index: usize,
    policy: ParticipantPolicy,
) -> Result<Vec<String>> {
    if let OperationBody::Unknown = operation.body {
        return Err(Error::UnknownOperationType(
            operation.body.type_name().to_string(),
        ));
    }

    if policy == ParticipantPolicy::PaymentsOnly && !is_payment(&operation.body) {
        return Ok(Vec::new());
    }

    let source = operation
        .source_account
        .as_deref()
        .unwrap_or(&tx.source_account);
    let mut participants = vec![source.to_string()];

    match &operation.body {
        OperationBody::CreateAccount { destination }
        | OperationBody::Payment { destination }
        | OperationBody::PathPaymentStrictReceive { destination }
        | OperationBody::PathPaymentStrictSend { destination }
        | OperationBody::AccountMerge { destination } => {
            participants.push(destination.clone());
        }
        OperationBody::AllowTrust { trustor } | OperationBody::SetTrustLineFlags { trustor } => {
            participants.push(trustor.clone());
        }
        OperationBody::CreateClaimableBalance { claimants } => {
            participants.extend(claimants.iter().cloned());
        }
        OperationBody::BeginSponsoringFutureReserves { sponsored_id } => {
            participants.push(sponsored_id.clone());
        }
        OperationBody::EndSponsoringFutureReserves => {
            // Failed transactions may not hold a well-formed begin/end sandwich.
            if tx.successful {
                participants.extend(tx.operations[..index].iter().rev().filter_map(|earlier| {
                    match &earlier.body {
                        OperationBody::BeginSponsoringFutureReserves { sponsored_id }
                            if sponsored_id == source =>
                        {
                            Some(sponsored_id.clone())
                        }
                        _ => None,
                    }
                }));
            }
        }
        OperationBody::RevokeSponsorship { target } => match target {
            RevokeSponsorshipTarget::LedgerEntry { key } => {
                participants.extend(ledger_key_participant(key));
            }
            // The signer itself can be an arbitrary account and is left out.
            RevokeSponsorshipTarget::Signer { account_id, .. } => {
                participants.push(account_id.clone());
            }
        },
        OperationBody::Clawback { from } => participants.push(from.clone()),
        OperationBody::ManageSellOffer
        | OperationBody::ManageBuyOffer
        | OperationBody::CreatePassiveSellOffer
        | OperationBody::SetOptions
        | OperationBody::ChangeTrust
        | OperationBody::Inflation
        | OperationBody::ManageData
        | OperationBody::BumpSequence
        | OperationBody::ClaimClaimableBalance
        | OperationBody::ClawbackClaimableBalance
        | OperationBody::LiquidityPoolDeposit
        | OperationBody::LiquidityPoolWithdraw
        | OperationBody::Unknown => {}
    }

    Ok(participants)
}

/// The account owning a sponsored ledger entry, if any.
fn ledger_key_participant(key: &LedgerKey) -> Option<String> {
    match key {
        LedgerKey::Account { account_id }
        | LedgerKey::Trustline { account_id }
        | LedgerKey::Data { account_id } => Some(account_id.clone()),
        LedgerKey::Offer { seller_id } => Some(seller_id.clone()),
        LedgerKey::ClaimableBalance { .. } => None,
    }
}
