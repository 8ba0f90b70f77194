use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{
    LoadedTransaction, TraceContext, TransactionCreatedEvent, TRANSACTION_CREATED_SCHEMA_VERSION,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("transaction {transaction_id} was loaded without its {relation}")]
    MissingRelation {
        transaction_id: i64,
        relation: &'static str,
    },
}

/// Builds the `TransactionCreated` event from a transaction loaded with its
/// relations. Touches nothing outside its arguments.
pub fn map_transaction_created(
    loaded: &LoadedTransaction,
    trace: &TraceContext,
    occurred_at: DateTime<Utc>,
) -> Result<TransactionCreatedEvent, MappingError> {
    let transaction = &loaded.transaction;
    let missing = |relation: &'static str| MappingError::MissingRelation {
        transaction_id: transaction.id,
        relation,
    };

    let fund = loaded.fund.as_ref().ok_or_else(|| missing("fund"))?;
    let sub_type = loaded.sub_type.as_ref().ok_or_else(|| missing("sub-type"))?;
    let transaction_type = sub_type
        .transaction_type
        .as_ref()
        .ok_or_else(|| missing("transaction type"))?;
    let status = loaded.status.as_ref().ok_or_else(|| missing("status"))?;
    let security = match transaction.security_id {
        Some(_) => Some(loaded.security.as_ref().ok_or_else(|| missing("security"))?),
        None => None,
    };

    Ok(TransactionCreatedEvent {
        transaction_id: transaction.id,
        fund_id: fund.id,
        fund_code: fund.code.clone(),
        fund_name: fund.name.clone(),
        security_id: security.map(|s| s.id),
        security_ticker: security.map(|s| s.ticker.clone()),
        security_name: security.map(|s| s.name.clone()),
        sub_type_id: sub_type.id,
        sub_type_description: sub_type.description.clone(),
        type_id: transaction_type.id,
        type_description: transaction_type.description.clone(),
        trade_date: transaction.trade_date.to_string(),
        settle_date: transaction.settle_date.to_string(),
        quantity: transaction.quantity.to_string(),
        price: transaction.price.to_string(),
        amount: transaction.amount.to_string(),
        currency: transaction.currency.clone(),
        status_id: status.id,
        status_description: status.description.clone(),
        created_at_unix_ms: transaction.created_at.timestamp_millis(),
        created_by_user_id: transaction.created_by_user_id.clone(),
        correlation_id: trace.correlation_id.clone(),
        request_id: trace.request_id.clone(),
        occurred_at_unix_ms: occurred_at.timestamp_millis(),
        schema_version: TRANSACTION_CREATED_SCHEMA_VERSION,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Fund, LedgerTransaction, Security, StatusDescriptor, TransactionDraft, TransactionSubType,
        TransactionType,
    };
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal_macros::dec;

    fn loaded(security_id: Option<i32>) -> LoadedTransaction {
        let created_at = Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 0).unwrap();
        let draft = TransactionDraft {
            fund_id: 1,
            security_id,
            sub_type_id: 4,
            trade_date: NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
            settle_date: NaiveDate::from_ymd_opt(2024, 5, 4).unwrap(),
            quantity: dec!(100),
            price: dec!(37.15),
            amount: dec!(3715.00),
            currency: "BRL".to_string(),
            created_by_user_id: "auth0|alice".to_string(),
        };
        LoadedTransaction {
            transaction: LedgerTransaction::from_draft(42, draft, created_at),
            fund: Some(Fund {
                id: 1,
                code: "FND001".to_string(),
                name: "Core Equity Fund".to_string(),
            }),
            security: security_id.map(|id| Security {
                id,
                ticker: "PETR4".to_string(),
                name: "Petrobras PN".to_string(),
            }),
            sub_type: Some(TransactionSubType {
                id: 4,
                description: "Buy".to_string(),
                type_id: 1,
                transaction_type: Some(TransactionType {
                    id: 1,
                    description: "Trade".to_string(),
                }),
            }),
            status: Some(StatusDescriptor {
                id: 1,
                description: "Pending".to_string(),
            }),
        }
    }

    #[test]
    fn test_maps_denormalized_fields() {
        let occurred_at = Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 1).unwrap();
        let trace = TraceContext::new("corr-1").with_request_id("req-9");
        let event = map_transaction_created(&loaded(Some(7)), &trace, occurred_at).unwrap();

        assert_eq!(event.transaction_id, 42);
        assert_eq!(event.fund_code, "FND001");
        assert_eq!(event.security_ticker.as_deref(), Some("PETR4"));
        assert_eq!(event.type_description, "Trade");
        assert_eq!(event.price, "37.15");
        assert_eq!(event.trade_date, "2024-05-02");
        assert_eq!(event.status_description, "Pending");
        assert_eq!(event.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(event.request_id.as_deref(), Some("req-9"));
        assert_eq!(event.occurred_at_unix_ms, occurred_at.timestamp_millis());
        assert_eq!(event.schema_version, 1);
    }

    #[test]
    fn test_transaction_without_security_maps_to_empty_security_fields() {
        let event = map_transaction_created(&loaded(None), &TraceContext::default(), Utc::now()).unwrap();
        assert_eq!(event.security_id, None);
        assert_eq!(event.security_name, None);
    }

    #[test]
    fn test_missing_relations_fail_loudly() {
        let mut no_fund = loaded(None);
        no_fund.fund = None;
        assert_eq!(
            map_transaction_created(&no_fund, &TraceContext::default(), Utc::now()),
            Err(MappingError::MissingRelation {
                transaction_id: 42,
                relation: "fund"
            })
        );

        let mut no_type = loaded(None);
        if let Some(sub_type) = no_type.sub_type.as_mut() {
            sub_type.transaction_type = None;
        }
        assert!(map_transaction_created(&no_type, &TraceContext::default(), Utc::now()).is_err());

        let mut unloaded_security = loaded(Some(7));
        unloaded_security.security = None;
        assert!(matches!(
            map_transaction_created(&unloaded_security, &TraceContext::default(), Utc::now()),
            Err(MappingError::MissingRelation { relation: "security", .. })
        ));
    }
}
