use tempfile::tempdir;
use watch_core::{Address, SubscriberId, SubscriptionRecord};
use watch_storage::SubscriptionStore;

fn addr(hex: &str) -> Address {
    Address::parse(hex).expect("address")
}

#[test]
fn records_survive_reopen() {
    let dir = tempdir().expect("tmpdir");
    let kept = SubscriptionRecord::new(
        SubscriberId::new("42").unwrap(),
        addr("0xb91986a9854be250ac681f6737836945d7aff6fa"),
        5_000_000_000_000_000_000,
        1_700_000_000_000,
    );
    let removed = SubscriptionRecord::new(
        SubscriberId::new("42").unwrap(),
        addr("0x000000000000000000000000000000000000dead"),
        1,
        1_700_000_000_000,
    );

    {
        let store = SubscriptionStore::open(dir.path()).expect("open");
        store.put(&kept).expect("put kept");
        store.put(&removed).expect("put removed");
        assert!(store.delete(&removed.key()).expect("delete"));
    }

    let store = SubscriptionStore::open(dir.path()).expect("reopen");
    assert_eq!(store.list_all().expect("list"), vec![kept.clone()]);
    assert_eq!(store.get(&kept.key()).expect("get"), Some(kept));
    assert!(store.get(&removed.key()).expect("get").is_none());
}

#[test]
fn uppercase_and_lowercase_inputs_share_one_key() {
    let store = SubscriptionStore::open_temporary().expect("open");
    let subscriber = SubscriberId::new("1").unwrap();
    let upper = SubscriptionRecord::new(
        subscriber.clone(),
        addr("0xB91986A9854BE250AC681F6737836945D7AFF6FA"),
        1,
        0,
    );
    let lower = SubscriptionRecord::new(
        subscriber,
        addr("0xb91986a9854be250ac681f6737836945d7aff6fa"),
        2,
        0,
    );
    store.put(&upper).unwrap();
    store.put(&lower).unwrap();

    let all = store.list_all().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].last_known_balance, 2);
}
