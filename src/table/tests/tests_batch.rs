#[cfg(test)]
mod tests {
    use crate::table::tests::helpers::*;
    use crate::{IndexKey, Table, TableError, VaultError};
    use tempfile::TempDir;

    #[test]
    fn indexes_catch_up_at_batch_end() {
        let tmp = TempDir::new().unwrap();
        let table = Table::open(open_vault(tmp.path()), "t").unwrap();
        table.create_ordered_index("age", age_of).unwrap();
        table.create_hash_index("name", name_of).unwrap();
        let kept = table.insert_row(&person(1, "kept")).unwrap();

        table.begin_batch().unwrap();
        let rows: Vec<_> = (0..50)
            .map(|i| table.insert_row(&person(100 + i, "bulk")).unwrap())
            .collect();
        table.update_row(kept, &person(2, "kept")).unwrap();

        // rows are readable, indexes still show the pre-batch state
        assert_eq!(table.get_row(rows[0]).unwrap(), Some(person(100, "bulk")));
        assert!(table.lookup("name", &IndexKey::from("bulk")).unwrap().is_empty());
        assert_eq!(table.lookup("age", &IndexKey::Int(1)).unwrap(), vec![kept]);

        assert_eq!(table.end_batch().unwrap(), 51);
        assert_eq!(table.lookup("name", &IndexKey::from("bulk")).unwrap(), rows);
        assert!(table.lookup("age", &IndexKey::Int(1)).unwrap().is_empty());
        assert_eq!(table.lookup("age", &IndexKey::Int(2)).unwrap(), vec![kept]);

        let in_range: Vec<_> = table
            .range("age", IndexKey::Int(100), IndexKey::Int(109))
            .unwrap()
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(in_range, rows[..10].to_vec());
    }

    #[test]
    fn batch_rebuild_matches_row_by_row_maintenance() {
        let tmp = TempDir::new().unwrap();
        let vault = open_vault(tmp.path());
        let incremental = Table::open(vault.clone(), "inc").unwrap();
        let batched = Table::open(vault, "bat").unwrap();
        for table in [&incremental, &batched] {
            table.create_ordered_index("age", age_of).unwrap();
        }

        let apply = |table: &Table| {
            for i in 0..40 {
                table.insert_row(&person(i % 7, "p")).unwrap();
            }
            for row in (0..40).step_by(3) {
                table.delete_row(row).unwrap();
            }
            for row in (1..40).step_by(5).filter(|row| row % 3 != 0) {
                table.update_row(row, &person(99, "p")).unwrap();
            }
        };
        apply(&incremental);
        batched.begin_batch().unwrap();
        apply(&batched);
        batched.end_batch().unwrap();

        for key in [0, 3, 6, 99] {
            assert_eq!(
                incremental.lookup("age", &IndexKey::Int(key)).unwrap(),
                batched.lookup("age", &IndexKey::Int(key)).unwrap()
            );
        }
    }

    #[test]
    fn cancel_leaves_rows_and_indexes_untouched() {
        let tmp = TempDir::new().unwrap();
        let table = Table::open(open_vault(tmp.path()), "t").unwrap();
        table.create_hash_index("name", name_of).unwrap();
        let row = table.insert_row(&person(1, "before")).unwrap();
        table.vault().flush().unwrap();

        table.begin_batch().unwrap();
        table.update_row(row, &person(1, "during")).unwrap();
        let extra = table.insert_row(&person(2, "extra")).unwrap();
        assert_eq!(table.cancel_batch().unwrap(), 2);

        assert_eq!(table.get_row(row).unwrap(), Some(person(1, "before")));
        assert_eq!(table.get_row(extra).unwrap(), None);
        assert_eq!(table.lookup("name", &IndexKey::from("before")).unwrap(), vec![row]);
        assert!(table.lookup("name", &IndexKey::from("during")).unwrap().is_empty());
    }

    #[test]
    fn batch_misuse() {
        let tmp = TempDir::new().unwrap();
        let vault = open_vault(tmp.path());
        let table = Table::open(vault.clone(), "t").unwrap();

        assert!(matches!(
            table.end_batch(),
            Err(TableError::Vault(VaultError::BatchState(_)))
        ));
        table.begin_batch().unwrap();
        assert!(matches!(
            table.begin_batch(),
            Err(TableError::Vault(VaultError::BatchState(_)))
        ));
        assert!(matches!(
            table.create_ordered_index("age", age_of),
            Err(TableError::Vault(VaultError::BatchState(_)))
        ));

        // the vault batch is shared by every table
        let other = Table::open(vault, "u").unwrap();
        assert!(matches!(
            other.begin_batch(),
            Err(TableError::Vault(VaultError::BatchState(_)))
        ));
        table.cancel_batch().unwrap();
        other.begin_batch().unwrap();
    }

    /// # Scenario
    /// Table `a` opens a batch; table `b`, sharing the vault, tries to
    /// insert, update and delete rows before `a` cancels.
    ///
    /// # Expected behavior
    /// `b` is refused while the batch it does not own is open, so its rows
    /// and indexes stay in agreement after the cancel; once the batch is
    /// gone `b` writes normally.
    #[test]
    fn other_tables_cannot_write_into_a_foreign_batch() {
        let tmp = TempDir::new().unwrap();
        let vault = open_vault(tmp.path());
        let a = Table::open(vault.clone(), "a").unwrap();
        let b = Table::open(vault, "b").unwrap();
        b.create_hash_index("name", name_of).unwrap();
        let existing = b.insert_row(&person(1, "old")).unwrap();

        a.begin_batch().unwrap();
        a.insert_row(&person(5, "in-batch")).unwrap();
        for result in [
            b.insert_row(&person(2, "hello")).map(|_| ()),
            b.update_row(existing, &person(3, "new")),
            b.delete_row(existing),
        ] {
            assert!(matches!(
                result,
                Err(TableError::Vault(VaultError::BatchState(_)))
            ));
        }
        assert_eq!(a.cancel_batch().unwrap(), 1);

        assert!(b.lookup("name", &IndexKey::from("hello")).unwrap().is_empty());
        assert_eq!(b.row_ids().unwrap(), vec![existing]);
        assert_eq!(b.lookup("name", &IndexKey::from("old")).unwrap(), vec![existing]);

        let row = b.insert_row(&person(2, "hello")).unwrap();
        assert_eq!(b.lookup("name", &IndexKey::from("hello")).unwrap(), vec![row]);
        assert_eq!(b.get_row(row).unwrap(), Some(person(2, "hello")));
    }
}
