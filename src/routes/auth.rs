use axum::extract::State;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::activity::ActivityEntry;
use crate::auth::accounts;
use crate::db::models::User;
use crate::envelope::Envelope;
use crate::error::{AppError, AppResult};
use crate::extractors::{ClientInfo, CurrentUser, JsonBody};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct RegisterBody {
    pub email: String,
    pub password: String,
    pub nickname: String,
}

#[derive(Deserialize)]
pub struct ActivateBody {
    pub email: String,
    pub code: String,
}

#[derive(Deserialize)]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginData {
    pub token: String,
    pub expires_at: i64,
    pub user: User,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/activate", post(activate))
        .route("/auth/login", post(login))
        .route("/users/me", get(me).put(update_me))
}

async fn register(
    State(state): State<AppState>,
    JsonBody(body): JsonBody<RegisterBody>,
) -> AppResult<Envelope<User>> {
    let registration = accounts::register(
        &state.db,
        &body.email,
        &body.password,
        &body.nickname,
        state.config.auth.bcrypt_cost,
    )?;

    // Mail delivery is not wired up; the code goes to the operator log.
    if let Some(code) = &registration.activation_code {
        tracing::info!(user_id = registration.user.id, email = %registration.user.email, code = %code, "activation code issued");
    } else {
        tracing::info!(user_id = registration.user.id, "first account registered as administrator");
    }
    Ok(Envelope::with_message(registration.user, "registered"))
}

async fn activate(
    State(state): State<AppState>,
    JsonBody(body): JsonBody<ActivateBody>,
) -> AppResult<Envelope<()>> {
    accounts::activate(&state.db, &body.email, &body.code)?;
    Ok(Envelope::with_message((), "activated"))
}

async fn login(
    State(state): State<AppState>,
    client: ClientInfo,
    JsonBody(body): JsonBody<LoginBody>,
) -> AppResult<Envelope<LoginData>> {
    let user = match accounts::authenticate(&state.db, &body.email, &body.password) {
        Ok(user) => user,
        Err(e) => {
            if !e.is_storage() {
                state.activity.record(
                    ActivityEntry::new(0, "login", false)
                        .detail(format!("{}: {}", body.email.trim(), e))
                        .client(&client.ip, &client.user_agent),
                );
            }
            return Err(e);
        }
    };

    let (token, expires_at) = state.tokens.mint(user.id, user.is_admin)?;
    state.activity.record(
        ActivityEntry::new(user.id, "login", true).client(&client.ip, &client.user_agent),
    );
    Ok(Envelope::ok(LoginData {
        token,
        expires_at,
        user,
    }))
}

async fn me(State(state): State<AppState>, user: CurrentUser) -> AppResult<Envelope<User>> {
    let conn = state.db.get()?;
    let profile =
        accounts::find_user(&conn, user.id)?.ok_or_else(|| AppError::NotFound("User".into()))?;
    Ok(Envelope::ok(profile))
}

async fn update_me(
    State(state): State<AppState>,
    user: CurrentUser,
    client: ClientInfo,
    JsonBody(update): JsonBody<accounts::ProfileUpdate>,
) -> AppResult<Envelope<User>> {
    let profile =
        accounts::update_profile(&state.db, user.id, &update, state.config.auth.bcrypt_cost)?;
    let detail = if update.new_password.is_some() {
        "password changed"
    } else {
        "profile updated"
    };
    state.activity.record(
        ActivityEntry::new(user.id, "update_profile", true)
            .detail(detail)
            .client(&client.ip, &client.user_agent),
    );
    Ok(Envelope::with_message(profile, "updated"))
}
