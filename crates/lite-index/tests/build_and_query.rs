use lite_index::{
    ALL_ALL, ALL_PAYMENTS, BuildConfig, FsLedgerSource, IndexStore, LedgerCloseMeta, LedgerRange,
    LedgerTransaction, Operation, OperationBody, SUCCESSFUL_PAYMENTS, StoreConfig, Toid,
    build_indices, connect_source,
};
use std::sync::Arc;

fn hash(sequence: u32, index: u32) -> [u8; 32] {
    let mut hash = [0u8; 32];
    hash[0] = (sequence % 256) as u8;
    hash[1..5].copy_from_slice(&sequence.to_be_bytes());
    hash[5..9].copy_from_slice(&index.to_be_bytes());
    hash
}

fn ledger(sequence: u32) -> LedgerCloseMeta {
    let create = LedgerTransaction {
        index: 1,
        hash: hash(sequence, 1),
        source_account: "GFUNDER".to_string(),
        successful: true,
        operations: vec![Operation::new(OperationBody::CreateAccount {
            destination: format!("GNEW{sequence}"),
        })],
    };
    let offer = LedgerTransaction {
        index: 2,
        hash: hash(sequence, 2),
        source_account: "GTRADER".to_string(),
        successful: sequence % 5 != 0,
        operations: vec![
            Operation::new(OperationBody::ManageSellOffer),
            Operation::with_source(
                "GPAYER",
                OperationBody::Payment {
                    destination: "GTRADER".to_string(),
                },
            ),
        ],
    };

    LedgerCloseMeta {
        sequence,
        transactions: vec![create, offer],
    }
}

#[tokio::test]
async fn build_then_query_from_a_fresh_store() {
    let ledgers = tempfile::tempdir().unwrap();
    let indices = tempfile::tempdir().unwrap();

    let writer = FsLedgerSource::new(ledgers.path());
    for sequence in 60..=140 {
        writer.put(&ledger(sequence)).await.unwrap();
    }

    let source = connect_source(&format!("file://{}", ledgers.path().display())).unwrap();
    let store_url = format!("file://{}", indices.path().display());
    let store = Arc::new(
        IndexStore::connect(&store_url, StoreConfig::default())
            .await
            .unwrap(),
    );

    let config = BuildConfig {
        ledger_range: LedgerRange::new(60, 0),
        workers: 2,
        ..Default::default()
    };
    let builder = build_indices(config, source, store).await.unwrap();
    assert_eq!(builder.last_built_ledger(), 140);

    let store = IndexStore::connect(&store_url, StoreConfig::default())
        .await
        .unwrap();

    // Ledgers 60..=63 are in checkpoint 1, 64..=127 in 2 and 128..=140 in 3.
    assert_eq!(store.next_active("GFUNDER", ALL_ALL, 0).await.unwrap(), Some(1));
    assert_eq!(store.next_active("GFUNDER", ALL_PAYMENTS, 3).await.unwrap(), Some(3));
    assert_eq!(store.next_active("GNEW100", ALL_ALL, 0).await.unwrap(), Some(2));
    assert_eq!(store.next_active("GNEW100", ALL_ALL, 3).await.unwrap(), None);

    // The trader's offer is not a payment, the payment to the trader is.
    assert_eq!(store.next_active("GTRADER", ALL_PAYMENTS, 0).await.unwrap(), Some(1));
    assert_eq!(
        store.next_active("GPAYER", SUCCESSFUL_PAYMENTS, 2).await.unwrap(),
        Some(2)
    );

    for sequence in [60, 64, 127, 140] {
        for index in [1, 2] {
            let toid = store
                .transaction_toid(&hash(sequence, index))
                .await
                .unwrap()
                .map(Toid::from_i64);
            assert_eq!(toid, Some(Toid::new(sequence as i32, index as i32, 0)));
        }
    }
    assert_eq!(store.transaction_toid(&hash(141, 1)).await.unwrap(), None);

    let accounts = store.read_accounts().await.unwrap();
    assert!(accounts.contains(&"GNEW77".to_string()));
    assert!(accounts.contains(&"GPAYER".to_string()));
}
