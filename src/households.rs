use std::fmt;
use std::str::FromStr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::info;

use crate::{
    auth::AuthUser,
    db::run_in_tx,
    id::{new_invite_code, new_uuid_v7},
    logging::LogScope,
    notifications::{self, kinds},
    state::AppState,
    time::now_ms,
    util::{ApiJson, ApiPath},
    AppError, AppResult,
};

pub const HOUSEHOLD_FORBIDDEN: &str = "HOUSEHOLD/FORBIDDEN";
pub const HOUSEHOLD_CONFLICT: &str = "HOUSEHOLD/CONFLICT";
pub const OWNER_CANNOT_LEAVE: &str = "HOUSEHOLD/OWNER_CANNOT_LEAVE";
pub const OWNER_ROLE_LOCKED: &str = "HOUSEHOLD/OWNER_ROLE_LOCKED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }

    /// Owners and admins manage household settings and content.
    pub fn can_manage(self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            "member" => Ok(Role::Member),
            other => Err(AppError::validation("role", "Unknown household role.")
                .with_context("role", other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Household {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub invite_code: String,
    pub owner_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<&SqliteRow> for Household {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            invite_code: row.try_get("invite_code")?,
            owner_id: row.try_get("owner_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HouseholdSummary {
    #[serde(flatten)]
    pub household: Household,
    pub role: Role,
    pub member_count: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    pub level: i64,
    pub xp: i64,
    pub role: Role,
    pub joined_at: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub level: i64,
    pub xp: i64,
    pub streak: i64,
    pub tasks_completed: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateHouseholdInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateHouseholdInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinHouseholdInput {
    pub invite_code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRoleInput {
    pub role: Role,
}

fn validate_name(name: &str) -> AppResult<String> {
    let trimmed = name.trim();
    let len = trimmed.chars().count();
    if len == 0 || len > 60 {
        return Err(AppError::validation(
            "name",
            "Household names must be between 1 and 60 characters.",
        ));
    }
    Ok(trimmed.to_string())
}

fn forbidden(household_id: &str) -> AppError {
    AppError::new(HOUSEHOLD_FORBIDDEN, "You are not a member of this household.")
        .with_context("household_id", household_id.to_string())
}

/// Role of `user_id` in `household_id`, if any.
pub async fn membership_role(
    pool: &SqlitePool,
    household_id: &str,
    user_id: &str,
) -> AppResult<Option<Role>> {
    let role: Option<String> = sqlx::query_scalar(
        "SELECT role FROM household_members WHERE household_id = ? AND user_id = ?",
    )
    .bind(household_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    role.map(|value| value.parse()).transpose()
}

/// Authorization guard for every household-scoped operation.
pub async fn ensure_member(pool: &SqlitePool, household_id: &str, user_id: &str) -> AppResult<Role> {
    membership_role(pool, household_id, user_id)
        .await?
        .ok_or_else(|| forbidden(household_id))
}

/// Like [`ensure_member`] but additionally requires an owner or admin.
pub async fn ensure_manager(pool: &SqlitePool, household_id: &str, user_id: &str) -> AppResult<Role> {
    let role = ensure_member(pool, household_id, user_id).await?;
    if role.can_manage() {
        Ok(role)
    } else {
        Err(AppError::new(
            HOUSEHOLD_FORBIDDEN,
            "Only household owners and admins can do that.",
        )
        .with_context("household_id", household_id.to_string()))
    }
}

pub async fn get_household(pool: &SqlitePool, id: &str) -> AppResult<Household> {
    let row = sqlx::query("SELECT * FROM households WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| {
            AppError::not_found("HOUSEHOLD", "Household not found").with_context("id", id.to_string())
        })?;
    Household::try_from(&row)
}

pub async fn create_household(
    pool: &SqlitePool,
    owner_id: &str,
    input: CreateHouseholdInput,
) -> AppResult<Household> {
    let name = validate_name(&input.name)?;
    let id = new_uuid_v7();
    let now = now_ms();
    let household_id = id.clone();
    let owner = owner_id.to_string();
    let description = input.description.map(|d| d.trim().to_string());

    run_in_tx(pool, move |tx| {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO households (id, name, description, invite_code, owner_id, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&household_id)
            .bind(&name)
            .bind(&description)
            .bind(new_invite_code())
            .bind(&owner)
            .bind(now)
            .bind(now)
            .execute(&mut **tx)
            .await?;
            sqlx::query(
                "INSERT INTO household_members (id, household_id, user_id, role, joined_at) \
                 VALUES (?, ?, ?, 'owner', ?)",
            )
            .bind(new_uuid_v7())
            .bind(&household_id)
            .bind(&owner)
            .bind(now)
            .execute(&mut **tx)
            .await?;
            Ok::<_, AppError>(())
        })
    })
    .await?;

    info!(target: "kamehouse", event = "household_created", household_id = %id, owner_id = %owner_id);
    get_household(pool, &id).await
}

pub async fn list_for_user(pool: &SqlitePool, user_id: &str) -> AppResult<Vec<HouseholdSummary>> {
    let rows = sqlx::query(
        "SELECT h.*, m.role AS my_role, \
           (SELECT COUNT(*) FROM household_members c WHERE c.household_id = h.id) AS member_count \
         FROM households h JOIN household_members m ON m.household_id = h.id \
         WHERE m.user_id = ? ORDER BY m.joined_at, h.id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let role: String = row.try_get("my_role")?;
            Ok(HouseholdSummary {
                household: Household::try_from(row)?,
                role: role.parse()?,
                member_count: row.try_get("member_count")?,
            })
        })
        .collect()
}

pub async fn get_for_member(pool: &SqlitePool, id: &str, user_id: &str) -> AppResult<Household> {
    ensure_member(pool, id, user_id).await?;
    get_household(pool, id).await
}

pub async fn update_household(
    pool: &SqlitePool,
    id: &str,
    user_id: &str,
    input: UpdateHouseholdInput,
) -> AppResult<Household> {
    ensure_manager(pool, id, user_id).await?;
    let name = input.name.as_deref().map(validate_name).transpose()?;
    sqlx::query(
        "UPDATE households SET name = COALESCE(?, name), description = COALESCE(?, description), \
         updated_at = ? WHERE id = ?",
    )
    .bind(name)
    .bind(input.description.as_deref().map(str::trim))
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    get_household(pool, id).await
}

pub async fn delete_household(pool: &SqlitePool, id: &str, user_id: &str) -> AppResult<()> {
    let role = ensure_member(pool, id, user_id).await?;
    if role != Role::Owner {
        return Err(AppError::new(
            HOUSEHOLD_FORBIDDEN,
            "Only the household owner can delete it.",
        ));
    }
    sqlx::query("DELETE FROM households WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    info!(target: "kamehouse", event = "household_deleted", household_id = %id);
    Ok(())
}

pub async fn join_by_code(pool: &SqlitePool, user: &AuthUser, code: &str) -> AppResult<Household> {
    let code = code.trim().to_ascii_uppercase();
    let row = sqlx::query("SELECT * FROM households WHERE invite_code = ?")
        .bind(&code)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found("INVITE", "No household uses that invite code."))?;
    let household = Household::try_from(&row)?;

    if membership_role(pool, &household.id, &user.id).await?.is_some() {
        return Err(AppError::new(
            HOUSEHOLD_CONFLICT,
            "You are already a member of this household.",
        ));
    }

    let scope = LogScope::new("households", "join", Some(&household.id), Some(&user.id));
    let household_id = household.id.clone();
    let user_id = user.id.clone();
    let message = format!("{} joined {}.", user.username, household.name);
    let joined = run_in_tx(pool, move |tx| {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO household_members (id, household_id, user_id, role, joined_at) \
                 VALUES (?, ?, ?, 'member', ?)",
            )
            .bind(new_uuid_v7())
            .bind(&household_id)
            .bind(&user_id)
            .bind(now_ms())
            .execute(&mut **tx)
            .await?;
            notifications::notify_household(
                &mut **tx,
                &household_id,
                &user_id,
                kinds::MEMBER_JOINED,
                "New household member",
                &message,
                None,
            )
            .await?;
            Ok::<_, AppError>(())
        })
    })
    .await;
    scope.finish(joined, |_| json!({ "role": Role::Member.as_str() }))?;
    Ok(household)
}

pub async fn leave(pool: &SqlitePool, household_id: &str, user_id: &str) -> AppResult<()> {
    let role = ensure_member(pool, household_id, user_id).await?;
    if role == Role::Owner {
        let others: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM household_members WHERE household_id = ? AND user_id <> ?",
        )
        .bind(household_id)
        .bind(user_id)
        .fetch_one(pool)
        .await?;
        if others > 0 {
            return Err(AppError::new(
                OWNER_CANNOT_LEAVE,
                "Transfer ownership before leaving a household with other members.",
            ));
        }
        // Last member out takes the household with them.
        return delete_household(pool, household_id, user_id).await;
    }

    let scope = LogScope::new("households", "leave", Some(household_id), Some(user_id));
    let result = sqlx::query("DELETE FROM household_members WHERE household_id = ? AND user_id = ?")
        .bind(household_id)
        .bind(user_id)
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(AppError::from);
    scope.finish(result, |_| json!({ "role": role.as_str() }))
}

pub async fn list_members(pool: &SqlitePool, household_id: &str, user_id: &str) -> AppResult<Vec<Member>> {
    ensure_member(pool, household_id, user_id).await?;
    let rows = sqlx::query(
        "SELECT u.id, u.username, u.display_name, u.avatar, u.level, u.xp, m.role, m.joined_at \
         FROM household_members m JOIN users u ON u.id = m.user_id \
         WHERE m.household_id = ? ORDER BY m.joined_at, u.username",
    )
    .bind(household_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let role: String = row.try_get("role")?;
            Ok(Member {
                user_id: row.try_get("id")?,
                username: row.try_get("username")?,
                display_name: row.try_get("display_name")?,
                avatar: row.try_get("avatar")?,
                level: row.try_get("level")?,
                xp: row.try_get("xp")?,
                role: role.parse()?,
                joined_at: row.try_get("joined_at")?,
            })
        })
        .collect()
}

/// Change a member's role. Only the owner may do this; assigning `owner`
/// transfers ownership and demotes the previous owner to admin.
pub async fn change_role(
    pool: &SqlitePool,
    household_id: &str,
    actor_id: &str,
    target_id: &str,
    role: Role,
) -> AppResult<Vec<Member>> {
    let actor_role = ensure_member(pool, household_id, actor_id).await?;
    if actor_role != Role::Owner {
        return Err(AppError::new(
            HOUSEHOLD_FORBIDDEN,
            "Only the household owner can change roles.",
        ));
    }
    if actor_id == target_id {
        return Err(AppError::new(
            OWNER_ROLE_LOCKED,
            "Transfer ownership to another member instead of changing your own role.",
        ));
    }
    if membership_role(pool, household_id, target_id).await?.is_none() {
        return Err(AppError::not_found("MEMBER", "That user is not a member of this household.")
            .with_context("user_id", target_id.to_string()));
    }

    let scope = LogScope::new("households", "change_role", Some(household_id), Some(actor_id));
    let household = household_id.to_string();
    let actor = actor_id.to_string();
    let target = target_id.to_string();
    let changed = run_in_tx(pool, move |tx| {
        Box::pin(async move {
            sqlx::query("UPDATE household_members SET role = ? WHERE household_id = ? AND user_id = ?")
                .bind(role.as_str())
                .bind(&household)
                .bind(&target)
                .execute(&mut **tx)
                .await?;
            if role == Role::Owner {
                sqlx::query(
                    "UPDATE household_members SET role = 'admin' WHERE household_id = ? AND user_id = ?",
                )
                .bind(&household)
                .bind(&actor)
                .execute(&mut **tx)
                .await?;
                sqlx::query("UPDATE households SET owner_id = ?, updated_at = ? WHERE id = ?")
                    .bind(&target)
                    .bind(now_ms())
                    .bind(&household)
                    .execute(&mut **tx)
                    .await?;
            }
            Ok::<_, AppError>(())
        })
    })
    .await;
    scope.finish(changed, |_| json!({ "target": target_id, "role": role.as_str() }))?;

    list_members(pool, household_id, actor_id).await
}

pub async fn remove_member(
    pool: &SqlitePool,
    household_id: &str,
    actor_id: &str,
    target_id: &str,
) -> AppResult<()> {
    let actor_role = ensure_manager(pool, household_id, actor_id).await?;
    if actor_id == target_id {
        return Err(AppError::validation(
            "userId",
            "Use leave to remove yourself from a household.",
        ));
    }
    let target_role = membership_role(pool, household_id, target_id)
        .await?
        .ok_or_else(|| {
            AppError::not_found("MEMBER", "That user is not a member of this household.")
                .with_context("user_id", target_id.to_string())
        })?;
    if target_role == Role::Owner || (target_role == Role::Admin && actor_role != Role::Owner) {
        return Err(AppError::new(
            HOUSEHOLD_FORBIDDEN,
            "You cannot remove a member with an equal or higher role.",
        ));
    }

    let scope = LogScope::new("households", "remove_member", Some(household_id), Some(actor_id));
    let result = sqlx::query("DELETE FROM household_members WHERE household_id = ? AND user_id = ?")
        .bind(household_id)
        .bind(target_id)
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(AppError::from);
    scope.finish(result, |_| json!({ "target": target_id }))
}

pub async fn regenerate_invite_code(
    pool: &SqlitePool,
    household_id: &str,
    user_id: &str,
) -> AppResult<Household> {
    ensure_manager(pool, household_id, user_id).await?;
    sqlx::query("UPDATE households SET invite_code = ?, updated_at = ? WHERE id = ?")
        .bind(new_invite_code())
        .bind(now_ms())
        .bind(household_id)
        .execute(pool)
        .await?;
    get_household(pool, household_id).await
}

pub async fn leaderboard(
    pool: &SqlitePool,
    household_id: &str,
    user_id: &str,
) -> AppResult<Vec<LeaderboardEntry>> {
    ensure_member(pool, household_id, user_id).await?;
    let rows = sqlx::query(
        "SELECT u.id, u.username, u.display_name, u.level, u.xp, u.streak, u.tasks_completed \
         FROM household_members m JOIN users u ON u.id = m.user_id \
         WHERE m.household_id = ? ORDER BY u.xp DESC, u.level DESC, u.username ASC",
    )
    .bind(household_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .enumerate()
        .map(|(index, row)| {
            Ok(LeaderboardEntry {
                rank: index + 1,
                user_id: row.try_get("id")?,
                username: row.try_get("username")?,
                display_name: row.try_get("display_name")?,
                level: row.try_get("level")?,
                xp: row.try_get("xp")?,
                streak: row.try_get("streak")?,
                tasks_completed: row.try_get("tasks_completed")?,
            })
        })
        .collect()
}

pub async fn create_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(input): ApiJson<CreateHouseholdInput>,
) -> AppResult<(StatusCode, Json<Household>)> {
    let household = create_household(&state.pool, &auth.id, input).await?;
    Ok((StatusCode::CREATED, Json(household)))
}

pub async fn list_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> AppResult<Json<Vec<HouseholdSummary>>> {
    Ok(Json(list_for_user(&state.pool, &auth.id).await?))
}

pub async fn get_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<Json<Household>> {
    Ok(Json(get_for_member(&state.pool, &id, &auth.id).await?))
}

pub async fn update_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
    ApiJson(input): ApiJson<UpdateHouseholdInput>,
) -> AppResult<Json<Household>> {
    Ok(Json(update_household(&state.pool, &id, &auth.id, input).await?))
}

pub async fn delete_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<StatusCode> {
    delete_household(&state.pool, &id, &auth.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn join_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(input): ApiJson<JoinHouseholdInput>,
) -> AppResult<Json<Household>> {
    Ok(Json(join_by_code(&state.pool, &auth, &input.invite_code).await?))
}

pub async fn leave_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<StatusCode> {
    leave(&state.pool, &id, &auth.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn members_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<Json<Vec<Member>>> {
    Ok(Json(list_members(&state.pool, &id, &auth.id).await?))
}

pub async fn change_role_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath((id, user_id)): ApiPath<(String, String)>,
    ApiJson(input): ApiJson<ChangeRoleInput>,
) -> AppResult<Json<Vec<Member>>> {
    Ok(Json(
        change_role(&state.pool, &id, &auth.id, &user_id, input.role).await?,
    ))
}

pub async fn remove_member_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath((id, user_id)): ApiPath<(String, String)>,
) -> AppResult<StatusCode> {
    remove_member(&state.pool, &id, &auth.id, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn invite_code_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<Json<Household>> {
    Ok(Json(regenerate_invite_code(&state.pool, &id, &auth.id).await?))
}

pub async fn leaderboard_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<Json<Vec<LeaderboardEntry>>> {
    Ok(Json(leaderboard(&state.pool, &id, &auth.id).await?))
}
