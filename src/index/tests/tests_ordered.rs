#[cfg(test)]
mod tests {
    use crate::index::ordered::CURSOR_CHUNK;
    use crate::index::{IndexKey, OrderedIndex, RowId};
    use rand::Rng;

    fn keys(index: &OrderedIndex<i64>, start: i64, end: i64) -> Vec<i64> {
        index
            .range(start, end)
            .map(|item| item.unwrap().0)
            .collect()
    }

    /// # Scenario
    /// Keys `[5, 1, 9, 3]` inserted out of order.
    ///
    /// # Expected behavior
    /// `range(2, 9)` yields `[3, 5, 9]` in that order.
    #[test]
    fn range_returns_keys_in_order() {
        let index = OrderedIndex::new();
        for (row, key) in [5, 1, 9, 3].into_iter().enumerate() {
            index.insert(key, row as RowId).unwrap();
        }
        assert_eq!(keys(&index, 2, 9), vec![3, 5, 9]);
        assert_eq!(keys(&index, 9, 9), vec![9]);
        assert!(keys(&index, 10, 20).is_empty());
        assert!(keys(&index, 9, 2).is_empty(), "inverted bounds are empty");
    }

    #[test]
    fn duplicate_keys_keep_every_row() {
        let index = OrderedIndex::new();
        assert!(index.insert(7, 30).unwrap());
        assert!(index.insert(7, 10).unwrap());
        assert!(index.insert(7, 20).unwrap());
        assert!(!index.insert(7, 20).unwrap(), "same pair twice");

        assert_eq!(index.lookup(&7).unwrap(), vec![10, 20, 30]);
        assert_eq!(index.len().unwrap(), 3);

        assert!(index.remove(&7, 20).unwrap());
        assert!(!index.remove(&7, 20).unwrap());
        assert_eq!(index.lookup(&7).unwrap(), vec![10, 30]);
        assert!(index.lookup(&8).unwrap().is_empty());
    }

    #[test]
    fn cursor_crosses_chunk_boundaries() {
        let index = OrderedIndex::new();
        let total = CURSOR_CHUNK as i64 * 3 + 5;
        for key in 0..total {
            index.insert(key, key as RowId).unwrap();
        }
        assert_eq!(keys(&index, 0, total), (0..total).collect::<Vec<_>>());
        assert_eq!(
            keys(&index, 10, CURSOR_CHUNK as i64 + 10),
            (10..=CURSOR_CHUNK as i64 + 10).collect::<Vec<_>>()
        );
    }

    #[test]
    fn cursor_restarts_from_the_beginning() {
        let index = OrderedIndex::new();
        for key in 0..10 {
            index.insert(key, 0).unwrap();
        }

        let mut cursor = index.range(2, 6);
        let first: Vec<_> = cursor.by_ref().take(2).map(|r| r.unwrap().0).collect();
        assert_eq!(first, vec![2, 3]);

        cursor.restart();
        let all: Vec<_> = cursor.by_ref().map(|r| r.unwrap().0).collect();
        assert_eq!(all, vec![2, 3, 4, 5, 6]);
        assert!(cursor.next().is_none(), "finite once exhausted");
    }

    #[test]
    fn restart_sees_entries_added_after_the_scan() {
        let index = OrderedIndex::new();
        index.insert(1, 0).unwrap();
        index.insert(5, 0).unwrap();

        let mut cursor = index.range(0, 10);
        assert_eq!(cursor.next().unwrap().unwrap().0, 1);
        assert_eq!(cursor.next().unwrap().unwrap().0, 5);
        index.insert(8, 0).unwrap();
        // the first chunk already ended the scan
        assert!(cursor.next().is_none());

        cursor.restart();
        assert_eq!(cursor.map(|r| r.unwrap().0).collect::<Vec<_>>(), vec![1, 5, 8]);
    }

    #[test]
    fn range_matches_linear_filter() {
        let mut rng = rand::rng();
        for _ in 0..50 {
            let index = OrderedIndex::new();
            let mut model: Vec<(i64, RowId)> = Vec::new();
            for row in 0..rng.random_range(0..300) {
                let key = rng.random_range(-100..100);
                index.insert(key, row).unwrap();
                model.push((key, row));
            }
            let a = rng.random_range(-120..120);
            let b = rng.random_range(a..=120);

            let mut expected: Vec<_> = model
                .iter()
                .filter(|(k, _)| a <= *k && *k <= b)
                .cloned()
                .collect();
            expected.sort();
            let got: Vec<_> = index.range(a, b).map(|r| r.unwrap()).collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn rebuild_matches_incremental_inserts() {
        let mut rng = rand::rng();
        let pairs: Vec<(i64, RowId)> = (0..500)
            .map(|row| (rng.random_range(0..50), row))
            .collect();

        let incremental = OrderedIndex::new();
        for (k, r) in &pairs {
            incremental.insert(*k, *r).unwrap();
        }
        let bulk = OrderedIndex::new();
        bulk.insert(999, 999).unwrap();
        bulk.rebuild(pairs.iter().rev().cloned()).unwrap();

        assert_eq!(bulk.len().unwrap(), incremental.len().unwrap());
        for key in 0..50 {
            assert_eq!(bulk.lookup(&key).unwrap(), incremental.lookup(&key).unwrap());
        }
        assert!(bulk.lookup(&999).unwrap().is_empty(), "rebuild clears old content");
        assert_eq!(
            bulk.range(10, 20).map(|r| r.unwrap()).collect::<Vec<_>>(),
            incremental.range(10, 20).map(|r| r.unwrap()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn mixed_key_kinds_order_by_kind() {
        let index = OrderedIndex::new();
        index.insert(IndexKey::Text("b".into()), 1).unwrap();
        index.insert(IndexKey::Int(10), 2).unwrap();
        index.insert(IndexKey::Bytes(vec![0]), 3).unwrap();
        index.insert(IndexKey::Text("a".into()), 4).unwrap();

        let rows: Vec<_> = index
            .range(IndexKey::Int(i64::MIN), IndexKey::Bytes(vec![0xff]))
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(rows, vec![2, 4, 1, 3]);
        assert_eq!(
            index.bounds().unwrap(),
            Some((IndexKey::Int(10), IndexKey::Bytes(vec![0])))
        );
    }
}
