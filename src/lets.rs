//! Local exchange (LETS) mutual credit: favors and the household ledger.
//!
//! Credits are created by the transfer itself, so balances inside a household
//! always sum to zero. A payer may not go below the configured credit limit.

use std::fmt;
use std::str::FromStr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};

use crate::{
    auth::AuthUser,
    categories::HouseholdQuery,
    db::run_in_tx,
    households::{ensure_member, membership_role},
    id::new_uuid_v7,
    logging::LogScope,
    notifications::{self, kinds, NewNotification},
    state::AppState,
    time::now_ms,
    util::{ApiJson, ApiPath, ApiQuery},
    AppError, AppResult,
};

pub const CREDIT_LIMIT: &str = "LETS/CREDIT_LIMIT";
pub const INVALID_AMOUNT: &str = "LETS/INVALID_AMOUNT";
pub const SELF_TRANSFER: &str = "LETS/SELF_TRANSFER";
pub const NOT_MEMBER: &str = "LETS/NOT_MEMBER";
pub const OWN_FAVOR: &str = "LETS/OWN_FAVOR";
pub const FAVOR_INVALID_STATE: &str = "FAVOR/INVALID_STATE";
/// Upper bound for a single favor or payment.
pub const MAX_CREDITS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FavorKind {
    /// The creator offers to do something; whoever accepts pays.
    Offer,
    /// The creator asks for help and pays whoever accepts.
    Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FavorStatus {
    Open,
    Accepted,
    Completed,
    Cancelled,
}

impl FavorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FavorKind::Offer => "offer",
            FavorKind::Request => "request",
        }
    }
}

impl FavorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FavorStatus::Open => "open",
            FavorStatus::Accepted => "accepted",
            FavorStatus::Completed => "completed",
            FavorStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FavorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FavorKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(FavorKind::Offer),
            "request" => Ok(FavorKind::Request),
            other => Err(AppError::validation("kind", "Unknown favor kind.")
                .with_context("kind", other.to_string())),
        }
    }
}

impl FromStr for FavorStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(FavorStatus::Open),
            "accepted" => Ok(FavorStatus::Accepted),
            "completed" => Ok(FavorStatus::Completed),
            "cancelled" => Ok(FavorStatus::Cancelled),
            other => Err(AppError::validation("status", "Unknown favor status.")
                .with_context("status", other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Favor {
    pub id: String,
    pub household_id: String,
    pub creator_id: String,
    pub kind: FavorKind,
    pub title: String,
    pub description: Option<String>,
    pub credits: i64,
    pub status: FavorStatus,
    pub accepted_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl Favor {
    /// (payer, payee) once the favor is done.
    pub fn parties(&self) -> Option<(&str, &str)> {
        let acceptor = self.accepted_by.as_deref()?;
        Some(match self.kind {
            FavorKind::Offer => (acceptor, self.creator_id.as_str()),
            FavorKind::Request => (self.creator_id.as_str(), acceptor),
        })
    }
}

impl TryFrom<&SqliteRow> for Favor {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            household_id: row.try_get("household_id")?,
            creator_id: row.try_get("creator_id")?,
            kind: kind.parse()?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            credits: row.try_get("credits")?,
            status: status.parse()?,
            accepted_by: row.try_get("accepted_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LetsTransaction {
    pub id: String,
    pub household_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub amount: i64,
    pub description: String,
    pub favor_id: Option<String>,
    pub created_at: i64,
}

impl TryFrom<&SqliteRow> for LetsTransaction {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            household_id: row.try_get("household_id")?,
            from_user_id: row.try_get("from_user_id")?,
            to_user_id: row.try_get("to_user_id")?,
            amount: row.try_get("amount")?,
            description: row.try_get("description")?,
            favor_id: row.try_get("favor_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub user_id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub balance: i64,
    /// False for people who left the household but still hold a balance.
    pub member: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFavorInput {
    pub household_id: String,
    pub kind: FavorKind,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub credits: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavorListQuery {
    pub household_id: String,
    #[serde(default)]
    pub status: Option<FavorStatus>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferInput {
    pub household_id: String,
    pub to_user_id: String,
    pub amount: i64,
    pub description: String,
}

/// A ledger entry to post.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub household_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub amount: i64,
    pub description: String,
    pub favor_id: Option<String>,
}

/// Balance of `user_id` in `household_id`: received minus paid.
pub async fn balance_of(conn: &mut SqliteConnection, household_id: &str, user_id: &str) -> AppResult<i64> {
    let balance: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(CASE WHEN to_user_id = ? THEN amount ELSE -amount END), 0) \
         FROM lets_transactions WHERE household_id = ? AND (to_user_id = ? OR from_user_id = ?)",
    )
    .bind(user_id)
    .bind(household_id)
    .bind(user_id)
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(balance)
}

fn check_transfer(transfer: &Transfer) -> AppResult<()> {
    if !(1..=MAX_CREDITS).contains(&transfer.amount) {
        return Err(AppError::new(INVALID_AMOUNT, "Amounts must be between 1 and 1000.")
            .with_context("amount", transfer.amount.to_string()));
    }
    if transfer.from_user_id == transfer.to_user_id {
        return Err(AppError::new(SELF_TRANSFER, "You cannot pay yourself."));
    }
    if transfer.description.trim().is_empty() {
        return Err(AppError::validation("description", "Describe what the payment is for."));
    }
    Ok(())
}

/// Post a transfer inside an open transaction, enforcing the payer's credit limit.
pub async fn post_transfer(
    conn: &mut SqliteConnection,
    transfer: &Transfer,
    credit_limit: i64,
) -> AppResult<LetsTransaction> {
    check_transfer(transfer)?;
    let balance = balance_of(&mut *conn, &transfer.household_id, &transfer.from_user_id).await?;
    let after = balance.checked_sub(transfer.amount);
    if after.map_or(true, |after| after < -credit_limit) {
        return Err(AppError::new(
            CREDIT_LIMIT,
            "This payment would exceed your credit limit.",
        )
        .with_context("balance", balance.to_string())
        .with_context("amount", transfer.amount.to_string())
        .with_context("limit", credit_limit.to_string()));
    }

    let id = new_uuid_v7();
    let now = now_ms();
    sqlx::query(
        "INSERT INTO lets_transactions (id, household_id, from_user_id, to_user_id, amount, description, favor_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&transfer.household_id)
    .bind(&transfer.from_user_id)
    .bind(&transfer.to_user_id)
    .bind(transfer.amount)
    .bind(transfer.description.trim())
    .bind(&transfer.favor_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    notifications::push(
        &mut *conn,
        NewNotification {
            user_id: transfer.to_user_id.clone(),
            household_id: Some(transfer.household_id.clone()),
            kind: kinds::LETS_PAYMENT,
            title: format!("You received {} credits", transfer.amount),
            message: transfer.description.trim().to_string(),
            link: Some("/lets".to_string()),
        },
    )
    .await?;
    Ok(LetsTransaction {
        id,
        household_id: transfer.household_id.clone(),
        from_user_id: transfer.from_user_id.clone(),
        to_user_id: transfer.to_user_id.clone(),
        amount: transfer.amount,
        description: transfer.description.trim().to_string(),
        favor_id: transfer.favor_id.clone(),
        created_at: now,
    })
}

/// Direct payment from the caller to another member.
pub async fn transfer(
    pool: &SqlitePool,
    from_user_id: &str,
    input: TransferInput,
    credit_limit: i64,
) -> AppResult<LetsTransaction> {
    ensure_member(pool, &input.household_id, from_user_id).await?;
    if membership_role(pool, &input.household_id, &input.to_user_id)
        .await?
        .is_none()
    {
        return Err(AppError::new(NOT_MEMBER, "The recipient is not a member of this household.")
            .with_context("user_id", input.to_user_id.clone()));
    }
    let transfer = Transfer {
        household_id: input.household_id,
        from_user_id: from_user_id.to_string(),
        to_user_id: input.to_user_id,
        amount: input.amount,
        description: input.description,
        favor_id: None,
    };
    check_transfer(&transfer)?;
    let scope = LogScope::new("lets", "transfer", Some(&transfer.household_id), Some(from_user_id));
    let result = run_in_tx(pool, move |tx| {
        Box::pin(async move { post_transfer(&mut **tx, &transfer, credit_limit).await })
    })
    .await;
    scope.finish(result, |t| json!({ "transaction_id": t.id, "amount": t.amount }))
}

fn favor_not_found(id: &str) -> AppError {
    AppError::not_found("FAVOR", "Favor not found").with_context("id", id.to_string())
}

async fn load_favor(pool: &SqlitePool, id: &str) -> AppResult<Favor> {
    let row = sqlx::query("SELECT * FROM lets_favors WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| favor_not_found(id))?;
    Favor::try_from(&row)
}

pub async fn find_favor(pool: &SqlitePool, id: &str, user_id: &str) -> AppResult<Favor> {
    let favor = load_favor(pool, id).await?;
    ensure_member(pool, &favor.household_id, user_id).await?;
    Ok(favor)
}

fn invalid_state(favor: &Favor, action: &str) -> AppError {
    AppError::new(
        FAVOR_INVALID_STATE,
        format!("A {} favor cannot be {action}.", favor.status),
    )
    .with_context("favor_id", favor.id.clone())
    .with_context("status", favor.status.to_string())
}

pub async fn create_favor(pool: &SqlitePool, user_id: &str, input: CreateFavorInput) -> AppResult<Favor> {
    ensure_member(pool, &input.household_id, user_id).await?;
    let title = input.title.trim();
    if title.is_empty() || title.chars().count() > 100 {
        return Err(AppError::validation(
            "title",
            "Favor titles must be between 1 and 100 characters.",
        ));
    }
    if !(1..=MAX_CREDITS).contains(&input.credits) {
        return Err(AppError::new(INVALID_AMOUNT, "Credits must be between 1 and 1000.")
            .with_context("credits", input.credits.to_string()));
    }

    let id = new_uuid_v7();
    let now = now_ms();
    sqlx::query(
        "INSERT INTO lets_favors (id, household_id, creator_id, kind, title, description, credits, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 'open', ?, ?)",
    )
    .bind(&id)
    .bind(&input.household_id)
    .bind(user_id)
    .bind(input.kind.as_str())
    .bind(title)
    .bind(&input.description)
    .bind(input.credits)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    load_favor(pool, &id).await
}

pub async fn list_favors(
    pool: &SqlitePool,
    user_id: &str,
    query: &FavorListQuery,
) -> AppResult<Vec<Favor>> {
    ensure_member(pool, &query.household_id, user_id).await?;
    let rows = sqlx::query(
        "SELECT * FROM lets_favors WHERE household_id = ? AND (? IS NULL OR status = ?) \
         ORDER BY created_at DESC, id DESC",
    )
    .bind(&query.household_id)
    .bind(query.status.map(FavorStatus::as_str))
    .bind(query.status.map(FavorStatus::as_str))
    .fetch_all(pool)
    .await?;
    rows.iter().map(Favor::try_from).collect()
}

pub async fn accept_favor(pool: &SqlitePool, id: &str, user: &AuthUser) -> AppResult<Favor> {
    let favor = find_favor(pool, id, &user.id).await?;
    if favor.creator_id == user.id {
        return Err(AppError::new(OWN_FAVOR, "You cannot accept your own favor."));
    }
    if favor.status != FavorStatus::Open {
        return Err(invalid_state(&favor, "accepted"));
    }
    let updated = sqlx::query(
        "UPDATE lets_favors SET status = 'accepted', accepted_by = ?, updated_at = ? \
         WHERE id = ? AND status = 'open'",
    )
    .bind(&user.id)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        // Someone else got there first.
        let current = load_favor(pool, id).await?;
        return Err(invalid_state(&current, "accepted"));
    }

    notifications::push(
        pool,
        NewNotification {
            user_id: favor.creator_id.clone(),
            household_id: Some(favor.household_id.clone()),
            kind: kinds::FAVOR,
            title: "Favor accepted".to_string(),
            message: format!("{} accepted \"{}\".", user.username, favor.title),
            link: Some("/lets".to_string()),
        },
    )
    .await?;
    load_favor(pool, id).await
}

/// Mark an accepted favor done and post its payment atomically.
pub async fn complete_favor(
    pool: &SqlitePool,
    id: &str,
    user_id: &str,
    credit_limit: i64,
) -> AppResult<(Favor, LetsTransaction)> {
    let favor = find_favor(pool, id, user_id).await?;
    if favor.creator_id != user_id && favor.accepted_by.as_deref() != Some(user_id) {
        return Err(AppError::forbidden(
            "FAVOR",
            "Only the people involved can complete a favor.",
        ));
    }
    if favor.status != FavorStatus::Accepted {
        return Err(invalid_state(&favor, "completed"));
    }
    let (payer, payee) = favor
        .parties()
        .ok_or_else(|| invalid_state(&favor, "completed"))?;
    let transfer = Transfer {
        household_id: favor.household_id.clone(),
        from_user_id: payer.to_string(),
        to_user_id: payee.to_string(),
        amount: favor.credits,
        description: format!("Favor: {}", favor.title),
        favor_id: Some(favor.id.clone()),
    };

    let scope = LogScope::new("lets", "complete_favor", Some(&favor.household_id), Some(user_id));
    let favor_id = favor.id.clone();
    let transaction = run_in_tx(pool, move |tx| {
        Box::pin(async move {
            let now = now_ms();
            let updated = sqlx::query(
                "UPDATE lets_favors SET status = 'completed', completed_at = ?, updated_at = ? \
                 WHERE id = ? AND status = 'accepted'",
            )
            .bind(now)
            .bind(now)
            .bind(&favor_id)
            .execute(&mut **tx)
            .await?
            .rows_affected();
            if updated == 0 {
                return Err(AppError::new(FAVOR_INVALID_STATE, "The favor is no longer accepted.")
                    .with_context("favor_id", favor_id.clone()));
            }
            post_transfer(&mut **tx, &transfer, credit_limit).await
        })
    })
    .await;
    let transaction = scope.finish(transaction, |t| json!({ "favor_id": id, "amount": t.amount }))?;

    Ok((load_favor(pool, id).await?, transaction))
}

pub async fn cancel_favor(pool: &SqlitePool, id: &str, user_id: &str) -> AppResult<Favor> {
    let favor = find_favor(pool, id, user_id).await?;
    if favor.creator_id != user_id {
        return Err(AppError::forbidden("FAVOR", "Only the creator can cancel a favor."));
    }
    if !matches!(favor.status, FavorStatus::Open | FavorStatus::Accepted) {
        return Err(invalid_state(&favor, "cancelled"));
    }
    sqlx::query("UPDATE lets_favors SET status = 'cancelled', updated_at = ? WHERE id = ?")
        .bind(now_ms())
        .bind(id)
        .execute(pool)
        .await?;
    load_favor(pool, id).await
}

pub async fn list_transactions(
    pool: &SqlitePool,
    household_id: &str,
    user_id: &str,
) -> AppResult<Vec<LetsTransaction>> {
    ensure_member(pool, household_id, user_id).await?;
    let rows = sqlx::query(
        "SELECT * FROM lets_transactions WHERE household_id = ? ORDER BY created_at DESC, id DESC",
    )
    .bind(household_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(LetsTransaction::try_from).collect()
}

/// Balance of every current member and of anyone who left with ledger
/// history, highest first.
pub async fn balances(pool: &SqlitePool, household_id: &str, user_id: &str) -> AppResult<Vec<Balance>> {
    ensure_member(pool, household_id, user_id).await?;
    let rows = sqlx::query(
        "WITH parties(user_id) AS ( \
           SELECT user_id FROM household_members WHERE household_id = ? \
           UNION SELECT to_user_id FROM lets_transactions WHERE household_id = ? \
           UNION SELECT from_user_id FROM lets_transactions WHERE household_id = ? \
         ) \
         SELECT u.id, u.username, u.display_name, \
           COALESCE((SELECT SUM(amount) FROM lets_transactions t WHERE t.household_id = ? AND t.to_user_id = u.id), 0) \
         - COALESCE((SELECT SUM(amount) FROM lets_transactions t WHERE t.household_id = ? AND t.from_user_id = u.id), 0) \
           AS balance, \
           EXISTS(SELECT 1 FROM household_members m WHERE m.household_id = ? AND m.user_id = u.id) AS member \
         FROM parties p JOIN users u ON u.id = p.user_id \
         ORDER BY balance DESC, u.username",
    )
    .bind(household_id)
    .bind(household_id)
    .bind(household_id)
    .bind(household_id)
    .bind(household_id)
    .bind(household_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(Balance {
                user_id: row.try_get("id")?,
                username: row.try_get("username")?,
                display_name: row.try_get("display_name")?,
                balance: row.try_get("balance")?,
                member: row.try_get("member")?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FavorCompletion {
    pub favor: Favor,
    pub transaction: LetsTransaction,
}

pub async fn create_favor_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(input): ApiJson<CreateFavorInput>,
) -> AppResult<(StatusCode, Json<Favor>)> {
    let favor = create_favor(&state.pool, &auth.id, input).await?;
    Ok((StatusCode::CREATED, Json(favor)))
}

pub async fn list_favors_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiQuery(query): ApiQuery<FavorListQuery>,
) -> AppResult<Json<Vec<Favor>>> {
    Ok(Json(list_favors(&state.pool, &auth.id, &query).await?))
}

pub async fn accept_favor_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<Json<Favor>> {
    Ok(Json(accept_favor(&state.pool, &id, &auth).await?))
}

pub async fn complete_favor_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<Json<FavorCompletion>> {
    let (favor, transaction) =
        complete_favor(&state.pool, &id, &auth.id, state.lets_credit_limit()).await?;
    Ok(Json(FavorCompletion { favor, transaction }))
}

pub async fn cancel_favor_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<Json<Favor>> {
    Ok(Json(cancel_favor(&state.pool, &id, &auth.id).await?))
}

pub async fn transfer_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(input): ApiJson<TransferInput>,
) -> AppResult<(StatusCode, Json<LetsTransaction>)> {
    let transaction = transfer(&state.pool, &auth.id, input, state.lets_credit_limit()).await?;
    Ok((StatusCode::CREATED, Json(transaction)))
}

pub async fn transactions_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiQuery(query): ApiQuery<HouseholdQuery>,
) -> AppResult<Json<Vec<LetsTransaction>>> {
    Ok(Json(
        list_transactions(&state.pool, &query.household_id, &auth.id).await?,
    ))
}

pub async fn balances_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiQuery(query): ApiQuery<HouseholdQuery>,
) -> AppResult<Json<Vec<Balance>>> {
    Ok(Json(balances(&state.pool, &query.household_id, &auth.id).await?))
}
