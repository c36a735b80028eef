//! Total order ids locating a transaction or operation in the ledger history.

/// Bits reserved for the operation order.
const OPERATION_BITS: u32 = 12;
/// Bits reserved for the transaction order.
const TRANSACTION_BITS: u32 = 20;

const OPERATION_MASK: i64 = (1 << OPERATION_BITS) - 1;
const TRANSACTION_MASK: i64 = (1 << TRANSACTION_BITS) - 1;

/// A `(ledger, transaction, operation)` triple packed into an `i64` as
/// `ledger << 32 | transaction << 12 | operation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Toid {
    pub ledger_sequence: i32,
    /// 1-based position of the transaction in its ledger.
    pub transaction_order: i32,
    pub operation_order: i32,
}

impl Toid {
    pub fn new(ledger_sequence: i32, transaction_order: i32, operation_order: i32) -> Self {
        Self {
            ledger_sequence,
            transaction_order,
            operation_order,
        }
    }

    pub fn to_i64(self) -> i64 {
        (i64::from(self.ledger_sequence) << (OPERATION_BITS + TRANSACTION_BITS))
            | ((i64::from(self.transaction_order) & TRANSACTION_MASK) << OPERATION_BITS)
            | (i64::from(self.operation_order) & OPERATION_MASK)
    }

    pub fn from_i64(id: i64) -> Self {
        Self {
            ledger_sequence: (id >> (OPERATION_BITS + TRANSACTION_BITS)) as i32,
            transaction_order: ((id >> OPERATION_BITS) & TRANSACTION_MASK) as i32,
            operation_order: (id & OPERATION_MASK) as i32,
        }
    }
}

impl From<Toid> for i64 {
    fn from(toid: Toid) -> Self {
        toid.to_i64()
    }
}
