use chrono::{DateTime, Months, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_PRICE_OR_QUANTITY: Decimal = dec!(9999999999.99999999);
const MAX_AMOUNT: Decimal = dec!(9999999999999999.99);

/// Lifecycle status of a ledger transaction, stored by numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Executed,
    Failed,
}

impl TransactionStatus {
    pub fn code(&self) -> i32 {
        match self {
            TransactionStatus::Pending => 1,
            TransactionStatus::Executed => 2,
            TransactionStatus::Failed => 8,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(TransactionStatus::Pending),
            2 => Some(TransactionStatus::Executed),
            8 => Some(TransactionStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransactionError {
    #[error("{field} must be a positive number")]
    NonPositiveId { field: &'static str },
    #[error("Trade date must be on or before the settle date")]
    TradeAfterSettle,
    #[error("Settle date cannot be more than one year in the future")]
    SettleTooFarAhead,
    #[error("Price cannot be negative")]
    NegativePrice,
    #[error("Price exceeds the maximum allowed value of 9,999,999,999.99999999")]
    PriceOutOfRange,
    #[error("Quantity exceeds the maximum allowed value of 9,999,999,999.99999999")]
    QuantityOutOfRange,
    #[error("Amount exceeds the maximum allowed value of 9,999,999,999,999,999.99")]
    AmountOutOfRange,
    #[error("Currency must be a 3 letter ISO code")]
    InvalidCurrency,
    #[error("CreatedByUserId cannot be empty")]
    MissingCreator,
    #[error("Transaction {0} not found")]
    NotFound(i64),
    #[error("Transaction {id} is not pending (current status: {status_id})")]
    NotPending { id: i64, status_id: i32 },
}

/// Fields supplied by the caller when recording a new transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionDraft {
    pub fund_id: i32,
    pub security_id: Option<i32>,
    pub sub_type_id: i32,
    pub trade_date: NaiveDate,
    pub settle_date: NaiveDate,
    pub quantity: Decimal,
    pub price: Decimal,
    pub amount: Decimal,
    pub currency: String,
    pub created_by_user_id: String,
}

impl TransactionDraft {
    /// Checks every domain rule and returns the normalized draft.
    pub fn validate(mut self, now: DateTime<Utc>) -> Result<Self, TransactionError> {
        validate_fields(
            self.fund_id,
            self.sub_type_id,
            self.trade_date,
            self.settle_date,
            self.quantity,
            self.price,
            self.amount,
            &self.currency,
            now,
        )?;
        if self.created_by_user_id.trim().is_empty() {
            return Err(TransactionError::MissingCreator);
        }
        self.currency = self.currency.trim().to_uppercase();
        self.created_by_user_id = self.created_by_user_id.trim().to_string();
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: i64,
    pub fund_id: i32,
    pub security_id: Option<i32>,
    pub sub_type_id: i32,
    pub trade_date: NaiveDate,
    pub settle_date: NaiveDate,
    pub quantity: Decimal,
    pub price: Decimal,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub created_by_user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl LedgerTransaction {
    pub fn from_draft(id: i64, draft: TransactionDraft, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            fund_id: draft.fund_id,
            security_id: draft.security_id,
            sub_type_id: draft.sub_type_id,
            trade_date: draft.trade_date,
            settle_date: draft.settle_date,
            quantity: draft.quantity,
            price: draft.price,
            amount: draft.amount,
            currency: draft.currency,
            status: TransactionStatus::Pending,
            created_by_user_id: draft.created_by_user_id,
            created_at,
            updated_at: None,
        }
    }

    /// Re-runs the domain rules against the stored values.
    pub fn check_rules(&self, now: DateTime<Utc>) -> Result<(), TransactionError> {
        validate_fields(
            self.fund_id,
            self.sub_type_id,
            self.trade_date,
            self.settle_date,
            self.quantity,
            self.price,
            self.amount,
            &self.currency,
            now,
        )
    }

    /// Resolves a pending transaction to Executed when the domain rules hold,
    /// otherwise to Failed with the violated rule.
    pub fn settle(&mut self, now: DateTime<Utc>) -> Result<SettlementOutcome, TransactionError> {
        if self.status != TransactionStatus::Pending {
            return Err(TransactionError::NotPending {
                id: self.id,
                status_id: self.status.code(),
            });
        }

        let outcome = match self.check_rules(now) {
            Ok(()) => SettlementOutcome::Executed,
            Err(violation) => SettlementOutcome::Rejected(violation),
        };
        self.status = match outcome {
            SettlementOutcome::Executed => TransactionStatus::Executed,
            SettlementOutcome::Rejected(_) => TransactionStatus::Failed,
        };
        self.updated_at = Some(now);
        Ok(outcome)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    Executed,
    Rejected(TransactionError),
}

#[allow(clippy::too_many_arguments)]
fn validate_fields(
    fund_id: i32,
    sub_type_id: i32,
    trade_date: NaiveDate,
    settle_date: NaiveDate,
    quantity: Decimal,
    price: Decimal,
    amount: Decimal,
    currency: &str,
    now: DateTime<Utc>,
) -> Result<(), TransactionError> {
    if fund_id <= 0 {
        return Err(TransactionError::NonPositiveId { field: "FundId" });
    }
    if sub_type_id <= 0 {
        return Err(TransactionError::NonPositiveId {
            field: "TransactionSubTypeId",
        });
    }
    if trade_date > settle_date {
        return Err(TransactionError::TradeAfterSettle);
    }
    let horizon = now
        .date_naive()
        .checked_add_months(Months::new(12))
        .unwrap_or(NaiveDate::MAX);
    if settle_date > horizon {
        return Err(TransactionError::SettleTooFarAhead);
    }
    if quantity.abs() > MAX_PRICE_OR_QUANTITY {
        return Err(TransactionError::QuantityOutOfRange);
    }
    if price < Decimal::ZERO {
        return Err(TransactionError::NegativePrice);
    }
    if price > MAX_PRICE_OR_QUANTITY {
        return Err(TransactionError::PriceOutOfRange);
    }
    if amount.abs() > MAX_AMOUNT {
        return Err(TransactionError::AmountOutOfRange);
    }
    let currency = currency.trim();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(TransactionError::InvalidCurrency);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fund {
    pub id: i32,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Security {
    pub id: i32,
    pub ticker: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionType {
    pub id: i32,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSubType {
    pub id: i32,
    pub description: String,
    pub type_id: i32,
    pub transaction_type: Option<TransactionType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDescriptor {
    pub id: i32,
    pub description: String,
}

/// A transaction together with the relations needed to describe it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedTransaction {
    pub transaction: LedgerTransaction,
    pub fund: Option<Fund>,
    pub security: Option<Security>,
    pub sub_type: Option<TransactionSubType>,
    pub status: Option<StatusDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn draft() -> TransactionDraft {
        TransactionDraft {
            fund_id: 1,
            security_id: Some(7),
            sub_type_id: 3,
            trade_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            settle_date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            quantity: dec!(100),
            price: dec!(12.5),
            amount: dec!(1250),
            currency: " brl ".to_string(),
            created_by_user_id: " user-1 ".to_string(),
        }
    }

    #[test]
    fn test_draft_is_normalized() {
        let draft = draft().validate(now()).unwrap();
        assert_eq!(draft.currency, "BRL");
        assert_eq!(draft.created_by_user_id, "user-1");
    }

    #[test]
    fn test_trade_after_settle_is_rejected() {
        let mut d = draft();
        d.trade_date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert_eq!(d.validate(now()), Err(TransactionError::TradeAfterSettle));
    }

    #[test]
    fn test_settle_date_more_than_a_year_ahead_is_rejected() {
        let mut d = draft();
        d.settle_date = NaiveDate::from_ymd_opt(2025, 3, 2).unwrap();
        assert_eq!(d.validate(now()), Err(TransactionError::SettleTooFarAhead));
    }

    #[test]
    fn test_currency_rules() {
        let mut d = draft();
        d.currency = "R$1".to_string();
        assert_eq!(d.validate(now()), Err(TransactionError::InvalidCurrency));

        let mut d = draft();
        d.currency = "EURO".to_string();
        assert_eq!(d.validate(now()), Err(TransactionError::InvalidCurrency));
    }

    #[test]
    fn test_amount_limits() {
        let mut d = draft();
        d.price = dec!(-0.01);
        assert_eq!(d.clone().validate(now()), Err(TransactionError::NegativePrice));

        let mut d = draft();
        d.amount = dec!(-10000000000000000.00);
        assert_eq!(d.validate(now()), Err(TransactionError::AmountOutOfRange));
    }

    #[test]
    fn test_blank_creator_is_rejected() {
        let mut d = draft();
        d.created_by_user_id = "   ".to_string();
        assert_eq!(d.validate(now()), Err(TransactionError::MissingCreator));
    }

    #[test]
    fn test_settle_moves_pending_to_executed() {
        let d = draft().validate(now()).unwrap();
        let mut tx = LedgerTransaction::from_draft(10, d, now());
        assert_eq!(tx.settle(now()).unwrap(), SettlementOutcome::Executed);
        assert_eq!(tx.status, TransactionStatus::Executed);
        assert!(tx.updated_at.is_some());
    }

    #[test]
    fn test_settle_marks_rule_violation_as_failed() {
        let d = draft().validate(now()).unwrap();
        let mut tx = LedgerTransaction::from_draft(10, d, now());
        tx.settle_date = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();

        let outcome = tx.settle(now()).unwrap();
        assert_eq!(
            outcome,
            SettlementOutcome::Rejected(TransactionError::SettleTooFarAhead)
        );
        assert_eq!(tx.status, TransactionStatus::Failed);
    }

    #[test]
    fn test_settle_refuses_non_pending() {
        let d = draft().validate(now()).unwrap();
        let mut tx = LedgerTransaction::from_draft(10, d, now());
        tx.status = TransactionStatus::Executed;
        assert_eq!(
            tx.settle(now()),
            Err(TransactionError::NotPending { id: 10, status_id: 2 })
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(TransactionStatus::from_code(8), Some(TransactionStatus::Failed));
        assert_eq!(TransactionStatus::Executed.code(), 2);
        assert_eq!(TransactionStatus::from_code(5), None);
    }
}
