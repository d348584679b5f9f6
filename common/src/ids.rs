use ulid::Ulid;
use uuid::Uuid;

/// Mint a new row id.
///
/// Ids are ULIDs persisted as `uuid` columns: time-sortable, so the maximum
/// id within any group is also the most recently created row.
pub fn new_id() -> Uuid {
    Ulid::new().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_by_creation_time() {
        let older = new_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let newer = new_id();

        assert!(newer > older);
    }
}
