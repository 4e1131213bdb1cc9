use std::collections::BTreeMap;
use std::env;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use image::{DynamicImage, ImageFormat, Rgba};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use snapstudio_contracts::events::{EventLog, EventPayload, StudioEvent};
use snapstudio_contracts::image::ImageRef;
use snapstudio_contracts::models::ModelRegistry;
use snapstudio_contracts::presets::find_preset;
use snapstudio_contracts::session::{Session, SessionError};

pub const EDIT_CAPABILITY: &str = "edit";
pub const EDIT_ASPECT_RATIO: &str = "1:1";
pub const CREDENTIAL_ENV_KEYS: &[&str] = &["GEMINI_API_KEY", "GOOGLE_API_KEY", "API_KEY"];

const QUOTA_MARKERS: &[&str] = &["429", "quota", "exhausted"];
const CREDENTIAL_MARKERS: &[&str] = &[
    "api key",
    "api_key",
    "credential",
    "permission",
    "unauthenticated",
    "requested entity was not found",
];
const ALL_BACKENDS_FAILED: &str = "All image models failed to process the request.";
const GENERIC_FAILURE: &str = "Something went wrong while processing the image.";
const DEFAULT_REQUEST_TIMEOUT_S: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditErrorKind {
    PreconditionFailed,
    BackendQuotaExhausted,
    BackendRejected,
    BackendNoImageProduced,
    TransportFailure,
}

impl EditErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreconditionFailed => "precondition_failed",
            Self::BackendQuotaExhausted => "backend_quota_exhausted",
            Self::BackendRejected => "backend_rejected",
            Self::BackendNoImageProduced => "backend_no_image_produced",
            Self::TransportFailure => "transport_failure",
        }
    }

    /// Only quota/capacity exhaustion moves on to the next candidate.
    pub fn falls_through(&self) -> bool {
        *self == Self::BackendQuotaExhausted
    }
}

impl std::fmt::Display for EditErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EditError {
    pub kind: EditErrorKind,
    pub message: String,
    pub backend: Option<String>,
    pub attempts: usize,
}

impl EditError {
    pub fn new(
        kind: EditErrorKind,
        message: impl Into<String>,
        backend: Option<&str>,
        attempts: usize,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            backend: backend.map(str::to_string),
            attempts,
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(EditErrorKind::PreconditionFailed, message, None, 0)
    }

    /// Message suitable for showing to the user. Transport failures carry
    /// low-level detail, so they collapse to a generic sentence.
    pub fn user_message(&self) -> &str {
        match self.kind {
            EditErrorKind::TransportFailure => GENERIC_FAILURE,
            _ => self.message.as_str(),
        }
    }

    pub fn user_hint(&self) -> Option<&'static str> {
        match self.kind {
            EditErrorKind::BackendQuotaExhausted => Some(
                "Every image model is rate limited or out of quota. Switch to a different credential and try again.",
            ),
            EditErrorKind::BackendRejected
                if contains_any(&self.message.to_ascii_lowercase(), CREDENTIAL_MARKERS) =>
            {
                Some("The credential is likely invalid or lacks access to this model.")
            }
            _ => None,
        }
    }
}

/// What went wrong on a single backend attempt, before classification.
#[derive(Debug)]
pub enum AttemptFailure<'a> {
    Backend(&'a anyhow::Error),
    NoImage(&'a str),
}

impl AttemptFailure<'_> {
    pub fn message(&self) -> String {
        match self {
            Self::Backend(err) => error_chain_text(err, 1024),
            Self::NoImage(text) => text.trim().to_string(),
        }
    }
}

/// Maps one failed attempt onto the closed error kind set.
///
/// Quota markers are matched case-insensitively against the rendered error
/// chain. Anything that is not a quota signature ends the whole dispatch.
pub fn classify_failure(failure: &AttemptFailure<'_>) -> EditErrorKind {
    let message = failure.message().to_ascii_lowercase();
    if contains_any(&message, QUOTA_MARKERS) {
        return EditErrorKind::BackendQuotaExhausted;
    }
    match failure {
        AttemptFailure::NoImage(_) => EditErrorKind::BackendNoImageProduced,
        AttemptFailure::Backend(err) if is_transport_error(err) => EditErrorKind::TransportFailure,
        AttemptFailure::Backend(_) => EditErrorKind::BackendRejected,
    }
}

fn is_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<reqwest::Error>().is_some()
            || cause.downcast_ref::<serde_json::Error>().is_some()
            || cause.downcast_ref::<io::Error>().is_some()
    })
}

pub trait CredentialSource: Send + Sync {
    /// Called right before every backend attempt; never cached.
    fn resolve(&self) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct EnvCredential {
    keys: Vec<String>,
}

impl Default for EnvCredential {
    fn default() -> Self {
        Self::new(CREDENTIAL_ENV_KEYS.iter().copied())
    }
}

impl EnvCredential {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl CredentialSource for EnvCredential {
    fn resolve(&self) -> Option<String> {
        self.keys.iter().find_map(|key| non_empty_env(key))
    }
}

/// Environment credential with an in-process override on top.
///
/// Clones share the override, so a switch made from one handle is seen by
/// the next attempt on every other handle.
#[derive(Debug, Clone, Default)]
pub struct SwitchableCredential {
    override_value: Arc<RwLock<Option<String>>>,
    fallback: EnvCredential,
}

impl SwitchableCredential {
    pub fn new(fallback: EnvCredential) -> Self {
        Self {
            override_value: Arc::new(RwLock::new(None)),
            fallback,
        }
    }

    pub fn set(&self, value: Option<String>) {
        let value = value
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty());
        match self.override_value.write() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }

    pub fn has_override(&self) -> bool {
        self.override_value
            .read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }
}

impl CredentialSource for SwitchableCredential {
    fn resolve(&self) -> Option<String> {
        let current = self
            .override_value
            .read()
            .ok()
            .and_then(|guard| guard.clone());
        current.or_else(|| self.fallback.resolve())
    }
}

#[derive(Debug, Clone)]
pub struct BackendEditRequest<'a> {
    pub model: &'a str,
    pub image: &'a ImageRef,
    pub instruction: &'a str,
    pub aspect_ratio: &'a str,
    pub api_key: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPart {
    InlineImage(ImageRef),
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyCandidate {
    pub parts: Vec<ReplyPart>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendReply {
    pub candidates: Vec<ReplyCandidate>,
}

impl BackendReply {
    pub fn first_image(&self) -> Option<&ImageRef> {
        self.candidates
            .iter()
            .flat_map(|candidate| candidate.parts.iter())
            .find_map(|part| match part {
                ReplyPart::InlineImage(image) if !image.is_empty() => Some(image),
                _ => None,
            })
    }

    pub fn first_text(&self) -> Option<&str> {
        self.candidates
            .iter()
            .flat_map(|candidate| candidate.parts.iter())
            .find_map(|part| match part {
                ReplyPart::Text(text) if !text.trim().is_empty() => Some(text.as_str()),
                _ => None,
            })
    }
}

pub trait EditBackend: Send + Sync {
    fn name(&self) -> &str;
    fn edit(&self, request: &BackendEditRequest<'_>) -> Result<BackendReply>;
}

#[derive(Default)]
pub struct EditBackendRegistry {
    providers: BTreeMap<String, Box<dyn EditBackend>>,
}

impl EditBackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<B: EditBackend + 'static>(&mut self, backend: B) {
        self.providers
            .insert(backend.name().to_string(), Box::new(backend));
    }

    pub fn get(&self, name: &str) -> Option<&dyn EditBackend> {
        self.providers.get(name).map(|backend| backend.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_backend_registry() -> EditBackendRegistry {
    let mut backends = EditBackendRegistry::new();
    backends.register(DryrunBackend);
    backends.register(GeminiBackend::new());
    backends
}

/// Offline backend: tints the source with a colour derived from the
/// instruction so repeated edits stay visibly distinct.
pub struct DryrunBackend;

impl EditBackend for DryrunBackend {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn edit(&self, request: &BackendEditRequest<'_>) -> Result<BackendReply> {
        let bytes = request.image.decode()?;
        let source = image::load_from_memory(&bytes).context("dryrun could not decode source image")?;
        let (r, g, b) = color_from_instruction(request.instruction);
        let mut canvas = source.to_rgba8();
        for pixel in canvas.pixels_mut() {
            let Rgba([pr, pg, pb, pa]) = *pixel;
            *pixel = Rgba([blend(pr, r), blend(pg, g), blend(pb, b), pa]);
        }

        let mut out = Vec::new();
        DynamicImage::ImageRgba8(canvas)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .context("dryrun PNG encode failed")?;

        Ok(BackendReply {
            candidates: vec![ReplyCandidate {
                parts: vec![
                    ReplyPart::Text(format!(
                        "dryrun tint #{} for {}",
                        hex::encode([r, g, b]),
                        request.model
                    )),
                    ReplyPart::InlineImage(ImageRef::from_bytes("image/png", &out)),
                ],
            }],
        })
    }
}

pub struct GeminiBackend {
    api_base: String,
    timeout: Duration,
    http: HttpClient,
}

impl Default for GeminiBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiBackend {
    pub fn new() -> Self {
        let timeout_s = non_empty_env("SNAPSTUDIO_REQUEST_TIMEOUT_S")
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value > 0.0)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_S);
        Self {
            api_base: non_empty_env("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            timeout: Duration::from_secs_f64(timeout_s),
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(request: &BackendEditRequest<'_>) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {
                        "inlineData": {
                            "mimeType": request.image.mime_type(),
                            "data": request.image.base64(),
                        }
                    },
                    { "text": request.instruction },
                ],
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
                "imageConfig": {
                    "aspectRatio": request.aspect_ratio,
                },
            },
        })
    }

    fn parse_reply(response_payload: &Value) -> BackendReply {
        let candidates = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut reply = BackendReply::default();
        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(Value::as_object)
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let mut out = ReplyCandidate::default();
            for part in parts {
                if let Some(inline) = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                {
                    let data = inline
                        .get("data")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if !data.is_empty() {
                        let mime = inline
                            .get("mimeType")
                            .or_else(|| inline.get("mime_type"))
                            .and_then(Value::as_str)
                            .unwrap_or("image/png");
                        out.parts
                            .push(ReplyPart::InlineImage(ImageRef::from_base64(mime, data)));
                    }
                    continue;
                }
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.parts.push(ReplyPart::Text(text.to_string()));
                }
            }
            reply.candidates.push(out);
        }
        reply
    }
}

impl EditBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn edit(&self, request: &BackendEditRequest<'_>) -> Result<BackendReply> {
        let Some(api_key) = request.api_key.filter(|key| !key.trim().is_empty()) else {
            bail!("GEMINI_API_KEY, GOOGLE_API_KEY or API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(request.model);
        let payload = Self::build_payload(request);
        let response = self
            .http
            .post(&endpoint)
            .header("x-goog-api-key", api_key)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Gemini", response)?;
        Ok(Self::parse_reply(&response_payload))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditSuccess {
    pub image: ImageRef,
    pub backend_used: String,
    pub attempts: usize,
}

#[derive(Debug)]
pub enum DispatchEvent<'a> {
    Attempt {
        model: &'a str,
        provider: &'a str,
        attempt: usize,
    },
    Fallback {
        model: &'a str,
        error: &'a EditError,
    },
}

/// Runs one edit against the candidate list with ordered fallback.
///
/// Holds no per-call state, so a single dispatcher can serve concurrent
/// callers. Attempts inside one call are strictly sequential.
pub struct EditDispatcher {
    candidates: Vec<String>,
    registry: ModelRegistry,
    backends: EditBackendRegistry,
}

impl EditDispatcher {
    pub fn new(
        candidates: Vec<String>,
        registry: ModelRegistry,
        backends: EditBackendRegistry,
    ) -> Result<Self> {
        let candidates = candidates
            .into_iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect::<Vec<String>>();
        if candidates.is_empty() {
            bail!("at least one image model is required");
        }
        Ok(Self {
            candidates,
            registry,
            backends,
        })
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn dispatch_edit(
        &self,
        image: Option<&ImageRef>,
        instruction: &str,
        credentials: &dyn CredentialSource,
    ) -> Result<EditSuccess, EditError> {
        self.dispatch_edit_with(image, instruction, credentials, &mut |_| {})
    }

    pub fn dispatch_edit_with(
        &self,
        image: Option<&ImageRef>,
        instruction: &str,
        credentials: &dyn CredentialSource,
        on_event: &mut dyn FnMut(DispatchEvent<'_>),
    ) -> Result<EditSuccess, EditError> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(EditError::precondition("Edit instruction is empty."));
        }
        let Some(image) = image.filter(|image| !image.is_empty()) else {
            return Err(EditError::precondition("No source image loaded."));
        };

        let mut last_error: Option<EditError> = None;
        for (idx, model) in self.candidates.iter().enumerate() {
            let attempt = idx + 1;
            let error = match self.attempt(model, image, instruction, credentials, attempt, on_event)
            {
                Ok(result) => {
                    return Ok(EditSuccess {
                        image: result,
                        backend_used: model.clone(),
                        attempts: attempt,
                    })
                }
                Err(error) => error,
            };
            if !error.kind.falls_through() {
                tracing::debug!(model = %model, kind = %error.kind, "image model failed terminally");
                return Err(error);
            }
            tracing::warn!(model = %model, attempt, "image model quota exhausted, trying fallback");
            on_event(DispatchEvent::Fallback {
                model,
                error: &error,
            });
            last_error = Some(error);
        }

        Err(last_error.unwrap_or_else(|| {
            EditError::new(
                EditErrorKind::BackendQuotaExhausted,
                ALL_BACKENDS_FAILED,
                None,
                self.candidates.len(),
            )
        }))
    }

    fn attempt(
        &self,
        model: &str,
        image: &ImageRef,
        instruction: &str,
        credentials: &dyn CredentialSource,
        attempt: usize,
        on_event: &mut dyn FnMut(DispatchEvent<'_>),
    ) -> Result<ImageRef, EditError> {
        let rejected = |message: String| {
            EditError::new(EditErrorKind::BackendRejected, message, Some(model), attempt)
        };
        let Some(spec) = self.registry.ensure(model, EDIT_CAPABILITY) else {
            return Err(rejected(format!(
                "Model {model} is not available for image editing."
            )));
        };
        let Some(backend) = self.backends.get(&spec.provider) else {
            return Err(rejected(format!(
                "No backend registered for provider '{}'.",
                spec.provider
            )));
        };

        on_event(DispatchEvent::Attempt {
            model,
            provider: &spec.provider,
            attempt,
        });
        tracing::debug!(model = %model, provider = %spec.provider, attempt, "dispatching image edit");

        let api_key = credentials.resolve();
        let request = BackendEditRequest {
            model,
            image,
            instruction,
            aspect_ratio: EDIT_ASPECT_RATIO,
            api_key: api_key.as_deref(),
        };
        let failed = |failure: AttemptFailure<'_>| {
            EditError::new(
                classify_failure(&failure),
                failure.message(),
                Some(model),
                attempt,
            )
        };

        let reply = match backend.edit(&request) {
            Ok(reply) => reply,
            Err(err) => return Err(failed(AttemptFailure::Backend(&err))),
        };
        if reply.candidates.is_empty() {
            let message = format!("Model {model} returned no candidates.");
            return Err(failed(AttemptFailure::NoImage(&message)));
        }
        if let Some(result) = reply.first_image() {
            return Ok(result.clone());
        }
        let message = reply
            .first_text()
            .map(str::to_string)
            .unwrap_or_else(|| format!("Model {model} failed to generate an image."));
        Err(failed(AttemptFailure::NoImage(&message)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StudioError {
    #[error(transparent)]
    Edit(#[from] EditError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("unknown preset '{0}'")]
    UnknownPreset(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditApplied {
    pub image: ImageRef,
    pub backend_used: String,
    pub attempts: usize,
    pub lineage: u64,
    pub history_len: usize,
}

/// Session, dispatcher, credential and event log wired together.
///
/// The session lock is released while a dispatch is in flight; results are
/// recorded through an edit ticket so an upload that lands mid-request wins.
/// Event log writes never change an outcome: a failed write is logged and the
/// operation carries on.
pub struct EditStudio {
    session: Mutex<Session>,
    dispatcher: EditDispatcher,
    credentials: SwitchableCredential,
    events: Option<EventLog>,
}

impl EditStudio {
    pub fn new(
        dispatcher: EditDispatcher,
        credentials: SwitchableCredential,
        events_path: Option<PathBuf>,
    ) -> Self {
        let session = Session::new();
        let events = events_path.map(|path| EventLog::new(path, session.session_id()));
        let studio = Self {
            session: Mutex::new(session),
            dispatcher,
            credentials,
            events,
        };
        studio.emit(
            StudioEvent::SessionStarted,
            map_object(json!({
                "candidates": studio.dispatcher.candidates(),
            })),
        );
        studio
    }

    pub fn dispatcher(&self) -> &EditDispatcher {
        &self.dispatcher
    }

    pub fn credentials(&self) -> &SwitchableCredential {
        &self.credentials
    }

    pub fn session(&self) -> Result<Session> {
        Ok(self.lock_session()?.clone())
    }

    pub fn load_source(&self, image: ImageRef) -> Result<u64> {
        let mime_type = image.mime_type().to_string();
        let lineage = self.lock_session()?.load_source(image).lineage();
        self.emit(
            StudioEvent::SourceLoaded,
            map_object(json!({
                "lineage": lineage,
                "mime_type": mime_type,
            })),
        );
        Ok(lineage)
    }

    pub fn load_source_path(&self, path: &Path) -> Result<u64> {
        let image = ImageRef::from_path(path)?;
        self.load_source(image)
    }

    pub fn apply_preset(&self, preset_id: &str) -> Result<EditApplied, StudioError> {
        let Some(preset) = find_preset(preset_id) else {
            return Err(StudioError::UnknownPreset(preset_id.trim().to_string()));
        };
        self.apply_edit(preset.prompt)
    }

    pub fn apply_edit(&self, instruction: &str) -> Result<EditApplied, StudioError> {
        let ticket = self.lock_session()?.begin_edit().ok();
        self.emit(
            StudioEvent::EditStarted,
            map_object(json!({
                "instruction": instruction.trim(),
                "lineage": ticket.as_ref().map(|ticket| ticket.lineage),
                "revision": ticket.as_ref().map(|ticket| ticket.revision),
            })),
        );

        let outcome = self.dispatcher.dispatch_edit_with(
            ticket.as_ref().map(|ticket| &ticket.source),
            instruction,
            &self.credentials,
            &mut |event| match event {
                DispatchEvent::Attempt {
                    model,
                    provider,
                    attempt,
                } => self.emit(
                    StudioEvent::BackendAttempt,
                    map_object(json!({
                        "model": model,
                        "provider": provider,
                        "attempt": attempt,
                    })),
                ),
                DispatchEvent::Fallback { model, error } => self.emit(
                    StudioEvent::BackendFallback,
                    map_object(json!({
                        "model": model,
                        "message": error.message,
                    })),
                ),
            },
        );

        let success = match outcome {
            Ok(success) => success,
            Err(error) => {
                self.emit(
                    StudioEvent::EditFailed,
                    map_object(json!({
                        "kind": error.kind.as_str(),
                        "message": error.message,
                        "backend": error.backend,
                        "attempts": error.attempts,
                    })),
                );
                return Err(StudioError::Edit(error));
            }
        };
        let Some(ticket) = ticket else {
            return Err(StudioError::Session(SessionError::InvalidState));
        };

        let recorded = {
            let mut session = self.lock_session()?;
            session
                .complete_edit(&ticket, success.image.clone())
                .map(|()| session.history().len())
        };
        let history_len = match recorded {
            Ok(history_len) => history_len,
            Err(err) => {
                self.emit(
                    StudioEvent::EditDiscarded,
                    map_object(json!({
                        "backend_used": success.backend_used,
                        "lineage": ticket.lineage,
                        "revision": ticket.revision,
                    })),
                );
                return Err(StudioError::Session(err));
            }
        };
        self.emit(
            StudioEvent::EditSucceeded,
            map_object(json!({
                "backend_used": success.backend_used,
                "attempts": success.attempts,
                "lineage": ticket.lineage,
                "history_len": history_len,
            })),
        );
        Ok(EditApplied {
            image: success.image,
            backend_used: success.backend_used,
            attempts: success.attempts,
            lineage: ticket.lineage,
            history_len,
        })
    }

    pub fn switch_credential(&self, value: Option<String>) {
        self.credentials.set(value);
        self.emit(
            StudioEvent::CredentialSwitched,
            map_object(json!({
                "override": self.credentials.has_override(),
            })),
        );
    }

    pub fn export_current(&self, path: &Path) -> Result<PathBuf> {
        let Some(image) = self.lock_session()?.current().cloned() else {
            bail!("No edited image to export.");
        };
        let bytes = image.decode()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        self.emit(
            StudioEvent::Exported,
            map_object(json!({
                "path": path.to_string_lossy().to_string(),
                "mime_type": image.mime_type(),
            })),
        );
        Ok(path.to_path_buf())
    }

    fn lock_session(&self) -> Result<std::sync::MutexGuard<'_, Session>> {
        self.session
            .lock()
            .map_err(|_| anyhow!("session lock poisoned"))
    }

    fn emit(&self, event: StudioEvent, payload: EventPayload) {
        let Some(log) = &self.events else {
            return;
        };
        if let Err(err) = log.record(event, payload) {
            tracing::warn!(event = %event, error = %format!("{err:#}"), "event log write failed");
        }
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn color_from_instruction(instruction: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(instruction.trim().as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn blend(base: u8, tint: u8) -> u8 {
    ((u16::from(base) * 3 + u16::from(tint)) / 4) as u8
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
