#[cfg(test)]
mod tests {
    use crate::table::tests::helpers::*;
    use crate::{IndexKey, Table, TableError, VaultError};
    use tempfile::TempDir;

    fn ages(table: &Table, start: i64, end: i64) -> Vec<i64> {
        table
            .range("age", IndexKey::Int(start), IndexKey::Int(end))
            .unwrap()
            .map(|item| match item.unwrap().0 {
                IndexKey::Int(age) => age,
                other => panic!("unexpected key {other:?}"),
            })
            .collect()
    }

    #[test]
    fn row_life_cycle() {
        let tmp = TempDir::new().unwrap();
        let table = Table::open(open_vault(tmp.path()), "people").unwrap();

        let a = table.insert_row(&person(30, "ann")).unwrap();
        let b = table.insert_row(&person(40, "bob")).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(table.get_row(a).unwrap(), Some(person(30, "ann")));

        table.update_row(a, &person(31, "ann")).unwrap();
        assert_eq!(table.get_row(a).unwrap(), Some(person(31, "ann")));

        table.delete_row(b).unwrap();
        assert_eq!(table.get_row(b).unwrap(), None);
        assert_eq!(table.row_ids().unwrap(), vec![a]);

        assert!(matches!(table.delete_row(b), Err(TableError::RowNotFound(1))));
        assert!(matches!(
            table.update_row(99, b"x"),
            Err(TableError::RowNotFound(99))
        ));
    }

    /// # Scenario
    /// Rows with ages `[5, 1, 9, 3]` under an ordered index on age.
    ///
    /// # Expected behavior
    /// A range scan over `2..=9` returns the ages `[3, 5, 9]` in order.
    #[test]
    fn ordered_index_range_scan() {
        let tmp = TempDir::new().unwrap();
        let table = Table::open(open_vault(tmp.path()), "t").unwrap();
        table.create_ordered_index("age", age_of).unwrap();

        for age in [5, 1, 9, 3] {
            table.insert_row(&person(age, "x")).unwrap();
        }
        assert_eq!(ages(&table, 2, 9), vec![3, 5, 9]);
        assert_eq!(table.lookup("age", &IndexKey::Int(9)).unwrap(), vec![2]);
    }

    #[test]
    fn updates_and_deletes_move_index_entries() {
        let tmp = TempDir::new().unwrap();
        let table = Table::open(open_vault(tmp.path()), "t").unwrap();
        table.create_ordered_index("age", age_of).unwrap();
        table.create_hash_index("name", name_of).unwrap();

        let row = table.insert_row(&person(20, "cat")).unwrap();
        table.update_row(row, &person(21, "dog")).unwrap();

        assert!(table.lookup("name", &IndexKey::from("cat")).unwrap().is_empty());
        assert_eq!(table.lookup("name", &IndexKey::from("dog")).unwrap(), vec![row]);
        assert_eq!(ages(&table, 0, 100), vec![21]);

        table.delete_row(row).unwrap();
        assert!(table.lookup("name", &IndexKey::from("dog")).unwrap().is_empty());
        assert!(ages(&table, 0, 100).is_empty());
    }

    #[test]
    fn extractor_none_keeps_row_out_of_index() {
        let tmp = TempDir::new().unwrap();
        let table = Table::open(open_vault(tmp.path()), "t").unwrap();
        table.create_hash_index("name", name_of).unwrap();

        let anonymous = table.insert_row(&person(50, "")).unwrap();
        let named = table.insert_row(&person(50, "eve")).unwrap();
        assert_eq!(table.lookup("name", &IndexKey::from("eve")).unwrap(), vec![named]);

        table.update_row(anonymous, &person(50, "eve")).unwrap();
        assert_eq!(
            table.lookup("name", &IndexKey::from("eve")).unwrap(),
            vec![anonymous, named]
        );
    }

    #[test]
    fn index_created_late_covers_existing_rows() {
        let tmp = TempDir::new().unwrap();
        let table = Table::open(open_vault(tmp.path()), "t").unwrap();
        for age in 0..100 {
            table.insert_row(&person(age % 10, "n")).unwrap();
        }

        table.create_hash_index("age", age_of).unwrap();
        assert_eq!(table.lookup("age", &IndexKey::Int(3)).unwrap().len(), 10);
        assert!(matches!(
            table.range("age", IndexKey::Int(0), IndexKey::Int(1)),
            Err(TableError::NotOrdered(_))
        ));
    }

    #[test]
    fn reopen_restores_rows_and_next_id() {
        let tmp = TempDir::new().unwrap();
        {
            let vault = open_vault(tmp.path());
            let table = Table::open(vault.clone(), "t").unwrap();
            for age in [10, 20, 30] {
                table.insert_row(&person(age, "r")).unwrap();
            }
            table.delete_row(2).unwrap();
            vault.close().unwrap();
        }

        let table = Table::open(open_vault(tmp.path()), "t").unwrap();
        assert_eq!(table.row_ids().unwrap(), vec![0, 1]);
        table.create_ordered_index("age", age_of).unwrap();
        assert_eq!(ages(&table, 0, 100), vec![10, 20]);

        let next = table.insert_row(&person(40, "r")).unwrap();
        assert_eq!(next, 2, "ids continue after the highest stored row");
    }

    #[test]
    fn tables_share_a_vault_without_mixing_rows() {
        let tmp = TempDir::new().unwrap();
        let vault = open_vault(tmp.path());
        let a = Table::open(vault.clone(), "a").unwrap();
        let ab = Table::open(vault.clone(), "ab").unwrap();

        a.insert_row(b"1|a").unwrap();
        ab.insert_row(b"1|ab").unwrap();
        ab.insert_row(b"2|ab").unwrap();

        assert_eq!(a.row_ids().unwrap(), vec![0]);
        assert_eq!(ab.row_ids().unwrap(), vec![0, 1]);
        assert_eq!(a.get_row(0).unwrap(), Some(b"1|a".to_vec()));
    }

    #[test]
    fn name_and_index_errors() {
        let tmp = TempDir::new().unwrap();
        let vault = open_vault(tmp.path());
        assert!(matches!(
            Table::open(vault.clone(), "a:b"),
            Err(TableError::InvalidName(_))
        ));
        assert!(matches!(Table::open(vault.clone(), ""), Err(TableError::InvalidName(_))));

        let table = Table::open(vault, "t").unwrap();
        table.create_ordered_index("age", age_of).unwrap();
        assert!(matches!(
            table.create_hash_index("age", age_of),
            Err(TableError::DuplicateIndex(_))
        ));
        assert!(matches!(
            table.lookup("missing", &IndexKey::Int(1)),
            Err(TableError::UnknownIndex(_))
        ));
        assert!(table.drop_index("age").unwrap());
        assert!(!table.drop_index("age").unwrap());
        assert!(table.index_names().unwrap().is_empty());
    }

    #[test]
    fn closed_vault_surfaces_as_vault_error() {
        let tmp = TempDir::new().unwrap();
        let vault = open_vault(tmp.path());
        let table = Table::open(vault.clone(), "t").unwrap();
        vault.close().unwrap();

        assert!(matches!(
            table.insert_row(b"1|x"),
            Err(TableError::Vault(VaultError::Closed))
        ));
    }
}
