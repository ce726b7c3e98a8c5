use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        Json,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio_stream::{Stream, StreamExt, wrappers::ReceiverStream};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use consult_flow::{
    AnswerEvent, AnswerRequest, ConsultationFlow, FlowError, Section, SessionStore, TurnResponse,
};

use crate::{
    llm::OpenRouterGenerator,
    models::{
        ChatRequest, ChatResponse, CreateConsultationRequest, CreateConsultationResponse,
        SessionView, SummariesResponse, SummaryView,
    },
    search::PgVectorRetriever,
    storage::PostgresSessionStore,
};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found_error(message: &str, id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": message,
            "session_id": id
        })),
    )
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

fn flow_error(e: FlowError, session_id: &str) -> ApiError {
    match e {
        FlowError::SessionNotFound(_) => not_found_error("Session not found", session_id),
        other => {
            error!("Flow error for session {}: {}", session_id, other);
            internal_error("Failed to process request", &other.to_string())
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub flow: Arc<ConsultationFlow>,
    pub store: Arc<dyn SessionStore>,
}

pub async fn create_app() -> Router {
    let app_state = create_app_state().await;
    build_router(app_state)
}

async fn create_app_state() -> AppState {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL environment variable must be set");
    // The knowledge base may live in a separate database; default to the
    // session database when it doesn't.
    let knowledge_url =
        std::env::var("KNOWLEDGE_DATABASE_URL").unwrap_or_else(|_| database_url.clone());

    let store = PostgresSessionStore::connect(&database_url)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to connect to PostgreSQL: {}", e);
            std::process::exit(1);
        });
    let retriever = PgVectorRetriever::connect(&knowledge_url)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to connect to knowledge base: {}", e);
            std::process::exit(1);
        });
    let generator = OpenRouterGenerator::from_env().unwrap_or_else(|e| {
        error!("Failed to configure LLM client: {}", e);
        std::process::exit(1);
    });

    let store: Arc<dyn SessionStore> = Arc::new(store);
    let flow = Arc::new(ConsultationFlow::new(
        store.clone(),
        Arc::new(generator),
        Arc::new(retriever),
    ));

    AppState { flow, store }
}

fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/api/consultations", post(create_consultation))
        .route("/api/consultations/{session_id}", get(get_consultation))
        .route("/api/consultations/{session_id}/history", get(get_history))
        .route("/api/consultations/{session_id}/summaries", get(get_summaries))
        .route("/api/consultations/{session_id}/chat", post(chat))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Medical Consultation Service",
        "version": "1.0.0",
        "description": "AI-guided structured medical consultations with evidence-backed answers",
        "endpoints": {
            "POST /api/consultations": "Start a new consultation session",
            "GET /api/consultations/{session_id}": "Get session state",
            "GET /api/consultations/{session_id}/history": "Get full chat history",
            "GET /api/consultations/{session_id}/summaries": "Get completed section summaries",
            "POST /api/consultations/{session_id}/chat": "Send a doctor message (questions stream via SSE)",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn create_consultation(
    State(state): State<AppState>,
    Json(request): Json<CreateConsultationRequest>,
) -> ApiResult<CreateConsultationResponse> {
    if request.patient_id.trim().is_empty() || request.provider_id.trim().is_empty() {
        return Err(bad_request_error("patient_id and provider_id are required"));
    }

    info!(
        "Starting consultation for patient {} with provider {}",
        request.patient_id, request.provider_id
    );

    let (session, message) = state
        .flow
        .start_session(&request.patient_id, &request.provider_id)
        .await
        .map_err(|e| {
            error!("Failed to start consultation: {}", e);
            internal_error("Failed to start consultation", &e.to_string())
        })?;

    Ok(Json(CreateConsultationResponse {
        session_id: session.id,
        current_section: session.current_section,
        message,
    }))
}

async fn get_consultation(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionView> {
    match state.store.get_session(&session_id).await {
        Ok(Some(session)) => Ok(Json(session.into())),
        Ok(None) => Err(not_found_error("Session not found", &session_id)),
        Err(e) => {
            error!("Failed to load session {}: {}", session_id, e);
            Err(internal_error("Failed to load session", &e.to_string()))
        }
    }
}

async fn get_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Value> {
    ensure_session_exists(&state, &session_id).await?;

    let messages = state
        .store
        .messages(&session_id, None)
        .await
        .map_err(|e| flow_error(e, &session_id))?;

    Ok(Json(json!({
        "session_id": session_id,
        "messages": messages
    })))
}

async fn get_summaries(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<SummariesResponse> {
    ensure_session_exists(&state, &session_id).await?;

    let summaries = state
        .store
        .summaries(&session_id)
        .await
        .map_err(|e| flow_error(e, &session_id))?;

    Ok(Json(SummariesResponse {
        session_id,
        summaries: summaries
            .into_iter()
            .map(|(section, summary)| SummaryView { section, summary })
            .collect(),
    }))
}

async fn ensure_session_exists(state: &AppState, session_id: &str) -> Result<(), ApiError> {
    match state.store.get_session(session_id).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(not_found_error("Session not found", session_id)),
        Err(e) => {
            error!("Failed to load session {}: {}", session_id, e);
            Err(internal_error("Failed to load session", &e.to_string()))
        }
    }
}

/// Plain turns answer with JSON; question turns upgrade to an SSE stream.
async fn chat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<axum::response::Response, ApiError> {
    use axum::response::IntoResponse;

    if request.message.trim().is_empty() {
        return Err(bad_request_error("Message cannot be empty"));
    }

    let turn = state
        .flow
        .process_turn(&session_id, &request.message)
        .await
        .map_err(|e| flow_error(e, &session_id))?;

    match turn {
        TurnResponse::MedicalQuestion {
            current_section,
            answer,
        }
        | TurnResponse::GeneralQuestion {
            current_section,
            answer,
        } => {
            let stream = answer_stream(&state, &session_id, current_section, answer).await?;
            Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
        }
        other => {
            // from_turn is total over the remaining variants.
            let response = ChatResponse::from_turn(&other)
                .ok_or_else(|| internal_error("Unexpected turn outcome", ""))?;
            Ok(Json(response).into_response())
        }
    }
}

async fn answer_stream(
    state: &AppState,
    session_id: &str,
    section: Section,
    answer: AnswerRequest,
) -> Result<impl Stream<Item = Result<Event, Infallible>> + use<>, ApiError> {
    let events = state
        .flow
        .stream_answer(session_id, section, answer)
        .await
        .map_err(|e| flow_error(e, session_id))?;

    let start = json!({ "type": "start", "current_section": section });
    let body = ReceiverStream::new(events).map(|event| match event {
        AnswerEvent::Structured(value) => value,
        AnswerEvent::Text(content) => json!({ "type": "text", "content": content }),
    });

    let stream = tokio_stream::once(start)
        .chain(body)
        .chain(tokio_stream::once(json!({ "type": "end" })))
        .map(|value| Ok(Event::default().data(value.to_string())));

    Ok(stream)
}
