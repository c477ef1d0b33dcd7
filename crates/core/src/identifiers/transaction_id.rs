use super::IdParseError;

opaque_identifier! {
    /// An opaque transaction ID, unique per `(origin, destination)` pair.
    pub type TransactionId, OwnedTransactionId, validate_transaction_id;
}

fn validate_transaction_id(s: &str) -> Result<(), IdParseError> {
    if s.is_empty() {
        return Err(IdParseError::Empty);
    }
    Ok(())
}
