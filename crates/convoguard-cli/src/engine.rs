use async_trait::async_trait;
use convoguard_compliance::AuditEventType;
use convoguard_core::{ConvoError, ConvoResult, InboundEvent, SessionState};
use convoguard_orchestrator::{Decision, DecisionEngine};
use serde::{Deserialize, Serialize};

const CONSENT_PROMPT: &str = "Para continuar con tu trámite necesitamos tu autorización para tratar \
tus datos personales. ¿Aceptas? Responde SI o NO.";
const CONSENT_THANKS: &str = "Gracias. Tu autorización quedó registrada; cuéntanos qué trámite necesitas.";
const CONSENT_REFUSED: &str =
    "Entendido. Sin tu autorización no podemos continuar. Escribe SI si cambias de opinión.";
const RECEIVED: &str = "Recibimos tu mensaje. Un asesor dará seguimiento a tu trámite.";
const APOLOGY: &str = "Tenemos una falla temporal. Por favor intenta de nuevo en unos minutos.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Stage {
    #[default]
    New,
    AwaitingConsent,
    Consented,
    Declined,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Progress {
    stage: Stage,
    #[serde(default)]
    messages: u64,
}

/// Consent gate served by the stock binary: asks for data-processing
/// consent before anything else and records the subject's answer.
/// Deployments with a real permit flow plug in their own [`DecisionEngine`].
pub struct ConsentGate;

fn answer(event: &InboundEvent) -> Option<bool> {
    let text = event.payload.get("text")?.as_str()?.trim().to_lowercase();
    match text.as_str() {
        "si" | "sí" | "yes" | "acepto" => Some(true),
        "no" | "no acepto" => Some(false),
        _ => None,
    }
}

#[async_trait]
impl DecisionEngine for ConsentGate {
    async fn decide(&self, state: &SessionState, event: &InboundEvent) -> ConvoResult<Decision> {
        let mut progress: Progress = if state.payload.is_empty() {
            Progress::default()
        } else {
            serde_json::from_slice(&state.payload)?
        };
        progress.messages += 1;

        let (reply, audit) = match (progress.stage, answer(event)) {
            (Stage::New, _) => {
                progress.stage = Stage::AwaitingConsent;
                (CONSENT_PROMPT, Some(AuditEventType::ConsentRequested))
            }
            (Stage::AwaitingConsent | Stage::Declined, Some(true)) => {
                progress.stage = Stage::Consented;
                (CONSENT_THANKS, Some(AuditEventType::ConsentGranted))
            }
            (Stage::AwaitingConsent, Some(false)) => {
                progress.stage = Stage::Declined;
                (CONSENT_REFUSED, Some(AuditEventType::ConsentDenied))
            }
            (Stage::AwaitingConsent, None) => (CONSENT_PROMPT, None),
            (Stage::Declined, _) => (CONSENT_REFUSED, None),
            (Stage::Consented, _) => (RECEIVED, None),
        };

        let mut decision = Decision::new(serde_json::to_vec(&progress)?).with_reply(reply);
        if let Some(event) = audit {
            decision = decision.with_audit(event);
        }
        Ok(decision)
    }

    async fn on_degraded(&self, _event: &InboundEvent, _error: &ConvoError) -> Option<String> {
        Some(APOLOGY.to_string())
    }
}
