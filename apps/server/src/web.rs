use axum::{
    extract::{Json, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Router,
};
use espresso_controller::{
    HeatingElement, LastInteraction, Monitor, PidController, PowerManager, PowerSchedule,
    PowerStatus, Sample, Sampler, TargetTemperature,
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use std::convert::Infallible;
use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use uuid::Uuid;

pub type BoxedSampler = Box<dyn Sampler>;

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<Monitor<BoxedSampler>>,
    pub heating: Arc<HeatingElement>,
    pub power: Arc<PowerManager>,
    pub pid: Arc<PidController<BoxedSampler>>,
}

#[derive(Deserialize)]
pub struct TargetRequest {
    value: f32,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": self.message,
        });
        (self.status, axum::Json(body)).into_response()
    }
}

pub fn router(state: AppState, static_dir: &Path) -> Router {
    Router::new()
        .route("/power/on", post(power_on))
        .route("/power/off", post(power_off))
        .route("/power/toggle", post(power_toggle))
        .route("/power/total-off", post(total_power_off))
        .route("/power/status", get(power_status))
        .route("/power/schedule", put(set_schedule))
        .route("/scheduling/on", post(scheduling_on))
        .route("/scheduling/off", post(scheduling_off))
        .route("/temperature/history", get(temperature_history))
        .route("/temperature/stream", get(temperature_stream))
        .route(
            "/temperature/target",
            get(get_target_temperature).put(set_target_temperature),
        )
        .route("/metrics", get(metrics))
        .fallback_service(ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn power_on(State(state): State<AppState>) -> axum::Json<PowerStatus> {
    state.power.power_on();
    axum::Json(state.power.status())
}

async fn power_off(State(state): State<AppState>) -> axum::Json<PowerStatus> {
    state.power.power_off();
    axum::Json(state.power.status())
}

async fn power_toggle(State(state): State<AppState>) -> axum::Json<PowerStatus> {
    state.power.power_toggle();
    axum::Json(state.power.status())
}

async fn total_power_off(State(state): State<AppState>) -> axum::Json<PowerStatus> {
    state.power.total_power_off();
    axum::Json(state.power.status())
}

async fn scheduling_on(State(state): State<AppState>) -> axum::Json<PowerStatus> {
    state.power.schedule_on();
    axum::Json(state.power.status())
}

async fn scheduling_off(State(state): State<AppState>) -> axum::Json<PowerStatus> {
    state.power.schedule_off();
    axum::Json(state.power.status())
}

async fn power_status(State(state): State<AppState>) -> axum::Json<PowerStatus> {
    axum::Json(state.power.status())
}

async fn set_schedule(
    State(state): State<AppState>,
    Json(schedule): Json<PowerSchedule>,
) -> Result<axum::Json<PowerStatus>, ApiError> {
    if let Err(e) = schedule.validate() {
        warn!(error = %e, "rejected power schedule");
        return Err(ApiError {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: e.to_string(),
        });
    }
    state.power.set_schedule(schedule);
    Ok(axum::Json(state.power.status()))
}

async fn temperature_history(State(state): State<AppState>) -> axum::Json<Vec<Sample>> {
    axum::Json(state.monitor.history())
}

async fn get_target_temperature(State(state): State<AppState>) -> axum::Json<TargetTemperature> {
    axum::Json(state.pid.target_temperature())
}

async fn set_target_temperature(
    State(state): State<AppState>,
    Json(request): Json<TargetRequest>,
) -> axum::Json<TargetTemperature> {
    axum::Json(state.pid.set_target_temperature(request.value))
}

fn gauge(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

/// Prometheus text exposition of the controller state.
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.power.status();
    let mut out = String::new();

    if let Some(sample) = state.monitor.latest() {
        gauge(
            &mut out,
            "espresso_boiler_temperature_celsius",
            "Smoothed boiler temperature.",
            sample.value,
        );
    }
    gauge(
        &mut out,
        "espresso_target_temperature_celsius",
        "Boiler set point.",
        state.pid.target_temperature().value,
    );
    gauge(
        &mut out,
        "espresso_heating_duty_factor",
        "Heating element duty factor, 0 to 1.",
        state.heating.duty_factor(),
    );
    gauge(
        &mut out,
        "espresso_heating_element_on",
        "Heater relay energised.",
        u8::from(state.heating.is_energised()),
    );
    gauge(
        &mut out,
        "espresso_power_on",
        "Machine power relay closed.",
        u8::from(status.power_on),
    );
    gauge(
        &mut out,
        "espresso_total_off",
        "Total-off latch set.",
        u8::from(status.total_off),
    );

    let name = "espresso_last_interaction";
    let _ = writeln!(out, "# HELP {name} What last changed the power state.");
    let _ = writeln!(out, "# TYPE {name} gauge");
    for interaction in LastInteraction::ALL {
        let _ = writeln!(
            out,
            "{name}{{interaction=\"{}\"}} {}",
            interaction.as_str(),
            u8::from(interaction == status.last_interaction)
        );
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        out,
    )
}

/// Unsubscribes from the monitor when the client goes away and the
/// response stream is dropped.
struct Subscription {
    id: Uuid,
    monitor: Arc<Monitor<BoxedSampler>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.monitor.unsubscribe(self.id);
        debug!(id = %self.id, "temperature stream closed");
    }
}

async fn temperature_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (id, samples) = state.monitor.subscribe();
    debug!(%id, "temperature stream opened");
    let subscription = Subscription {
        id,
        monitor: Arc::clone(&state.monitor),
    };

    let events = stream::unfold((samples, subscription), |(mut samples, subscription)| async move {
        let sample = samples.recv().await?;
        let event = Event::default()
            .event("temperature")
            .json_data(sample)
            .unwrap_or_else(|e| Event::default().comment(format!("unencodable sample: {e}")));
        Some((Ok(event), (samples, subscription)))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
