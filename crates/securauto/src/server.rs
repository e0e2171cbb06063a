use axum::{
    extract::{FromRequestParts, Multipart, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
        Html, IntoResponse, Redirect, Response,
    },
    routing::{get, post},
    Form, Json, Router,
};
use chrono::Utc;
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dashboard;
use crate::error::AdminError;
use crate::html::{self, Notice};
use crate::parser;
use crate::profile;
use crate::provisioning::{self, NewUser};
use crate::realtime::{ListenerHandle, Realtime};
use crate::session::{AdminSession, AuthManager, SESSION_TTL_HOURS};
use crate::storage::LocalStorage;
use crate::store::DocumentStore;

pub const SESSION_COOKIE: &str = "securauto_session";

/// Approved users listed under the provisioning forms
const USER_LIST_LIMIT: usize = 50;

/// Buffered feed updates per browser before older pushes are dropped
const FEED_BUFFER: usize = 16;

/// Application state shared across requests
pub struct AppState {
    pub store: Arc<DocumentStore>,
    pub realtime: Arc<Realtime>,
    pub auth: AuthManager,
    pub secure_cookies: bool,
}

impl AppState {
    pub fn new(store: Arc<DocumentStore>, storage: LocalStorage, secure_cookies: bool) -> Self {
        let realtime = Arc::new(Realtime::new(Arc::clone(&store)));
        let auth = AuthManager::new(Arc::clone(&store), storage, Arc::clone(&realtime));
        Self {
            store,
            realtime,
            auth,
            secure_cookies,
        }
    }
}

type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/login", get(login_form_handler).post(login_handler))
        .route("/logout", post(logout_handler))
        .route("/users", get(users_handler).post(add_user_handler))
        .route("/users/import", post(import_handler))
        .route("/dashboard", get(dashboard_handler))
        .route("/dashboard/aggregates", get(aggregates_handler))
        .route("/dashboard/notifications", get(notifications_handler))
        .route("/dashboard/export.csv", get(export_handler))
        .route("/profile", get(profile_handler))
        .route("/profile/name", post(profile_name_handler))
        .route("/profile/password", post(profile_password_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Restore persisted sessions, then serve until Ctrl+C
pub async fn serve(state: SharedState, addr: SocketAddr) -> anyhow::Result<()> {
    let restored = state.auth.restore_sessions(Utc::now()).await?;
    info!(sessions = restored, "Sessions ready");

    let app = router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Server running at http://{}", addr);

    let realtime = Arc::clone(&state.realtime);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
            }
            // Live feeds never end on their own; closing them lets shutdown finish
            let detached = realtime.unsubscribe_all();
            info!(listeners = detached, "Shutting down");
        })
        .await?;

    state.realtime.unsubscribe_all();
    info!("Server stopped");
    Ok(())
}

// ========== session cookie ==========

fn session_cookie(id: Uuid, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE,
        id,
        SESSION_TTL_HOURS * 3600
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn clear_session_cookie(secure: bool) -> String {
    let mut cookie = format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE);
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Session id carried by the request's cookies, if any
fn session_id(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().strip_prefix(SESSION_COOKIE)?.strip_prefix('='))
        .find_map(|id| id.parse().ok())
}

async fn current_session(state: &AppState, headers: &HeaderMap) -> Option<AdminSession> {
    let id = session_id(headers)?;
    state.auth.current(id, Utc::now()).await
}

/// Extractor for routes that need a signed-in admin.
/// Anonymous requests are sent to the login page.
pub struct CurrentSession(pub AdminSession);

impl FromRequestParts<SharedState> for CurrentSession {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        match current_session(state, &parts.headers).await {
            Some(session) => Ok(CurrentSession(session)),
            None => Err(Redirect::to("/login").into_response()),
        }
    }
}

/// Where an admin lands after signing in
fn landing(session: &AdminSession) -> &'static str {
    if session.legion().is_some() {
        "/dashboard"
    } else {
        "/users"
    }
}

/// Turn a screen error into an inline notice; storage failures become a 500
fn notice_for(err: AdminError) -> Result<Notice, Response> {
    match err {
        AdminError::Store(_) => Err(err.into_response()),
        other => {
            debug!(error = %other, "Showing error notice");
            Ok(Notice::Error(other.public_message()))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    notice: Option<String>,
}

impl PageQuery {
    fn notice(&self) -> Option<Notice> {
        match self.notice.as_deref()? {
            "access_denied" => Some(Notice::Error(
                "Le tableau de bord est réservé aux administrateurs de légion".to_string(),
            )),
            "name_updated" => Some(Notice::Success("Nom d'affichage mis à jour".to_string())),
            "password_changed" => Some(Notice::Success("Mot de passe modifié".to_string())),
            _ => None,
        }
    }
}

// ========== auth ==========

async fn index_handler(State(state): State<SharedState>, headers: HeaderMap) -> Redirect {
    match current_session(&state, &headers).await {
        Some(session) => Redirect::to(landing(&session)),
        None => Redirect::to("/login"),
    }
}

async fn login_form_handler(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    match current_session(&state, &headers).await {
        Some(session) => Redirect::to(landing(&session)).into_response(),
        None => Html(html::login_page("", None).into_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    email: String,
    password: String,
}

async fn login_handler(State(state): State<SharedState>, Form(form): Form<LoginForm>) -> Response {
    match state.auth.login(&form.email, &form.password, Utc::now()).await {
        Ok(session) => (
            [(header::SET_COOKIE, session_cookie(session.id, state.secure_cookies))],
            Redirect::to(landing(&session)),
        )
            .into_response(),
        Err(err) => {
            let status = err.status_code();
            match notice_for(err) {
                Ok(notice) => {
                    let page = html::login_page(form.email.trim(), Some(&notice));
                    (status, Html(page.into_string())).into_response()
                }
                Err(response) => response,
            }
        }
    }
}

async fn logout_handler(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    match session_id(&headers) {
        Some(id) if state.auth.is_authenticated(id).await => {
            if let Err(e) = state.auth.logout(id, Utc::now()).await {
                warn!(session = %id, error = %e, "Logout failed");
            }
        }
        Some(id) => debug!(session = %id, "Logout for unknown session"),
        None => {}
    }
    (
        [(header::SET_COOKIE, clear_session_cookie(state.secure_cookies))],
        Redirect::to("/login"),
    )
        .into_response()
}

// ========== provisioning ==========

fn render_users(
    state: &AppState,
    session: &AdminSession,
    notice: Option<&Notice>,
    report: Option<&provisioning::ImportReport>,
) -> Response {
    match provisioning::list_users(&state.store, USER_LIST_LIMIT) {
        Ok(users) => Html(html::users_page(session, &users, notice, report).into_string()).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn users_handler(
    State(state): State<SharedState>,
    CurrentSession(session): CurrentSession,
    Query(query): Query<PageQuery>,
) -> Response {
    render_users(&state, &session, query.notice().as_ref(), None)
}

async fn add_user_handler(
    State(state): State<SharedState>,
    CurrentSession(session): CurrentSession,
    Form(fields): Form<NewUser>,
) -> Response {
    let notice = match provisioning::add_single_user(&state.store, &session, &fields, Utc::now()) {
        Ok(user) => Notice::Success(format!("{} ({}) a été ajouté", user.display_name, user.matricule)),
        Err(err) => match notice_for(err) {
            Ok(notice) => notice,
            Err(response) => return response,
        },
    };
    render_users(&state, &session, Some(&notice), None)
}

async fn import_handler(
    State(state): State<SharedState>,
    CurrentSession(session): CurrentSession,
    mut multipart: Multipart,
) -> Response {
    let mut upload = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => match field.bytes().await {
                Ok(bytes) => {
                    upload = Some(bytes);
                    break;
                }
                Err(e) => return (StatusCode::BAD_REQUEST, e.body_text()).into_response(),
            },
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => return (StatusCode::BAD_REQUEST, e.body_text()).into_response(),
        }
    }

    let Some(bytes) = upload else {
        let notice = Notice::Error("Aucun fichier reçu".to_string());
        return render_users(&state, &session, Some(&notice), None);
    };

    let rows = match parser::parse_user_sheet(&bytes) {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "Unreadable import file");
            let notice = Notice::Error(format!("Fichier illisible : {}", e));
            return render_users(&state, &session, Some(&notice), None);
        }
    };

    match provisioning::import_batch(&state.store, &session, &rows, Utc::now()) {
        Ok(report) => render_users(&state, &session, None, Some(&report)),
        Err(e) => e.into_response(),
    }
}

// ========== dashboard ==========

fn access_denied() -> Response {
    Redirect::to("/users?notice=access_denied").into_response()
}

async fn dashboard_handler(
    State(state): State<SharedState>,
    CurrentSession(session): CurrentSession,
) -> Response {
    match dashboard::load_aggregates(&state.store, &session) {
        Ok(aggregates) => Html(html::dashboard_page(&session, &aggregates).into_string()).into_response(),
        Err(AdminError::AccessDenied) => access_denied(),
        Err(e) => e.into_response(),
    }
}

async fn aggregates_handler(
    State(state): State<SharedState>,
    CurrentSession(session): CurrentSession,
) -> Result<Json<dashboard::Aggregates>, AdminError> {
    Ok(Json(dashboard::load_aggregates(&state.store, &session)?))
}

/// SSE body that keeps its listener attached for as long as the browser
/// holds the connection
struct FeedStream {
    events: ReceiverStream<Result<Event, Infallible>>,
    listener: Option<ListenerHandle>,
}

impl Drop for FeedStream {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            debug!(listener = %listener.id(), "Live feed closed");
            listener.dispose();
        }
    }
}

impl Stream for FeedStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

async fn notifications_handler(
    State(state): State<SharedState>,
    CurrentSession(session): CurrentSession,
) -> Result<Sse<KeepAliveStream<FeedStream>>, AdminError> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(FEED_BUFFER);

    let listener = dashboard::subscribe_notifications(&state.realtime, &session, move |feed| {
        let event = Event::default().data(html::render_feed(&feed).into_string());
        if tx.try_send(Ok(event)).is_err() {
            debug!("Feed update dropped");
        }
    })?;

    debug!(
        listener = %listener.id(),
        active = state.realtime.active_count(),
        "Live feed opened"
    );

    let stream = FeedStream {
        events: ReceiverStream::new(rx),
        listener: Some(listener),
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn export_handler(
    State(state): State<SharedState>,
    CurrentSession(session): CurrentSession,
) -> Response {
    let now = Utc::now();
    match dashboard::export_csv(&state.store, &session, now) {
        Ok(text) => {
            let legion = session.legion().unwrap_or_default();
            let disposition = format!(
                "attachment; filename=\"{}\"",
                dashboard::export_filename(legion, now)
            );
            (
                [
                    (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                text,
            )
                .into_response()
        }
        Err(AdminError::AccessDenied) => access_denied(),
        Err(e) => e.into_response(),
    }
}

// ========== profile ==========

fn render_profile(state: &AppState, session: &AdminSession, notice: Option<&Notice>) -> Response {
    match profile::load_profile(&state.store, Some(session), Utc::now()) {
        Ok(view) => Html(html::profile_page(session, &view, notice).into_string()).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn profile_handler(
    State(state): State<SharedState>,
    CurrentSession(session): CurrentSession,
    Query(query): Query<PageQuery>,
) -> Response {
    render_profile(&state, &session, query.notice().as_ref())
}

#[derive(Debug, Deserialize)]
struct NameForm {
    display_name: String,
}

async fn profile_name_handler(
    State(state): State<SharedState>,
    CurrentSession(session): CurrentSession,
    Form(form): Form<NameForm>,
) -> Response {
    match profile::update_display_name(&state.store, &state.auth, &session, &form.display_name, Utc::now()).await {
        Ok(_) => Redirect::to("/profile?notice=name_updated").into_response(),
        Err(err) => match notice_for(err) {
            Ok(notice) => render_profile(&state, &session, Some(&notice)),
            Err(response) => response,
        },
    }
}

#[derive(Debug, Deserialize)]
struct PasswordForm {
    current: String,
    new: String,
    confirm: String,
}

async fn profile_password_handler(
    State(state): State<SharedState>,
    CurrentSession(session): CurrentSession,
    Form(form): Form<PasswordForm>,
) -> Response {
    match profile::change_password(&state.store, &session, &form.current, &form.new, &form.confirm, Utc::now()) {
        Ok(()) => Redirect::to("/profile?notice=password_changed").into_response(),
        Err(err) => match notice_for(err) {
            Ok(notice) => render_profile(&state, &session, Some(&notice)),
            Err(response) => response,
        },
    }
}

async fn health_handler() -> &'static str {
    "OK"
}
