//! Reasoning oracle: the external classifier every turn consults.
//!
//! The core never decides intent itself. An oracle returns an intent label
//! plus extracted slots; the login flow and the dispatcher act on those.

use std::sync::Arc;

use async_trait::async_trait;
use kcart_core::domain::session::{ContextKind, Session};
use kcart_core::domain::trace::ToolCall;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::llm::{LlmClient, LlmError};

/// Closed intent catalogue. Unrecognised labels become `Unknown`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Intent {
    IsCustomer,
    IsSupplier,
    HasAccount,
    NewUser,
    VerifyAccount,
    Register,
    CheckAvailability,
    StorageAdvice,
    NutritionQuery,
    SeasonalQuery,
    GeneralAdvisory,
    PlaceOrder,
    ConfirmOrder,
    SetDeliveryDate,
    SetDeliveryLocation,
    CheckDeliveries,
    CheckStock,
    ViewExpiringProducts,
    RequestPricingInsight,
    GenerateProductImage,
    ViewFlashSales,
    AcceptFlashSale,
    DeclineFlashSale,
    SalesSummary,
    AddProduct,
    UpdateInventory,
    SetQuantity,
    SetPrice,
    SetExpiryDate,
    AcceptOrder,
    DeclineOrder,
    ViewDeliverySchedule,
    CheckDeliveriesByDate,
    Unknown,
}

impl Intent {
    pub const ALL: [Intent; 34] = [
        Intent::IsCustomer,
        Intent::IsSupplier,
        Intent::HasAccount,
        Intent::NewUser,
        Intent::VerifyAccount,
        Intent::Register,
        Intent::CheckAvailability,
        Intent::StorageAdvice,
        Intent::NutritionQuery,
        Intent::SeasonalQuery,
        Intent::GeneralAdvisory,
        Intent::PlaceOrder,
        Intent::ConfirmOrder,
        Intent::SetDeliveryDate,
        Intent::SetDeliveryLocation,
        Intent::CheckDeliveries,
        Intent::CheckStock,
        Intent::ViewExpiringProducts,
        Intent::RequestPricingInsight,
        Intent::GenerateProductImage,
        Intent::ViewFlashSales,
        Intent::AcceptFlashSale,
        Intent::DeclineFlashSale,
        Intent::SalesSummary,
        Intent::AddProduct,
        Intent::UpdateInventory,
        Intent::SetQuantity,
        Intent::SetPrice,
        Intent::SetExpiryDate,
        Intent::AcceptOrder,
        Intent::DeclineOrder,
        Intent::ViewDeliverySchedule,
        Intent::CheckDeliveriesByDate,
        Intent::Unknown,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::IsCustomer => "intent.user.is_customer",
            Self::IsSupplier => "intent.user.is_supplier",
            Self::HasAccount => "intent.user.has_account",
            Self::NewUser => "intent.user.new_user",
            Self::VerifyAccount => "intent.user.verify_account",
            Self::Register => "intent.customer.register",
            Self::CheckAvailability => "intent.customer.check_availability",
            Self::StorageAdvice => "intent.customer.storage_advice",
            Self::NutritionQuery => "intent.customer.nutrition_query",
            Self::SeasonalQuery => "intent.customer.seasonal_query",
            Self::GeneralAdvisory => "intent.customer.general_advisory",
            Self::PlaceOrder => "intent.customer.place_order",
            Self::ConfirmOrder => "intent.customer.confirm_order",
            Self::SetDeliveryDate => "intent.customer.set_delivery_date",
            Self::SetDeliveryLocation => "intent.customer.set_delivery_location",
            Self::CheckDeliveries => "intent.customer.check_deliveries",
            Self::CheckStock => "intent.supplier.check_stock",
            Self::ViewExpiringProducts => "intent.supplier.view_expiring_products",
            Self::RequestPricingInsight => "intent.supplier.request_pricing_insight",
            Self::GenerateProductImage => "intent.supplier.generate_product_image",
            Self::ViewFlashSales => "intent.supplier.view_flash_sales",
            Self::AcceptFlashSale => "intent.supplier.accept_flash_sale",
            Self::DeclineFlashSale => "intent.supplier.decline_flash_sale",
            Self::SalesSummary => "intent.supplier.sales_summary",
            Self::AddProduct => "intent.supplier.add_product",
            Self::UpdateInventory => "intent.supplier.update_inventory",
            Self::SetQuantity => "intent.supplier.set_quantity",
            Self::SetPrice => "intent.supplier.set_price",
            Self::SetExpiryDate => "intent.supplier.set_expiry_date",
            Self::AcceptOrder => "intent.supplier.accept_order",
            Self::DeclineOrder => "intent.supplier.decline_order",
            Self::ViewDeliverySchedule => "intent.supplier.view_delivery_schedule",
            Self::CheckDeliveriesByDate => "intent.supplier.check_deliveries_by_date",
            Self::Unknown => "intent.unknown",
        }
    }

    /// Accepts the dotted label or its bare suffix (`check_stock`).
    pub fn parse(label: &str) -> Self {
        let normalized = label.trim().to_ascii_lowercase();
        let normalized = match normalized.as_str() {
            "intent.supplier.register" => Self::Register.label().to_string(),
            "intent.customer.confirm_payment" | "confirm_payment" => {
                Self::ConfirmOrder.label().to_string()
            }
            _ => normalized,
        };
        Self::ALL
            .into_iter()
            .find(|intent| {
                let full = intent.label();
                full == normalized || full.rsplit('.').next() == Some(normalized.as_str())
            })
            .unwrap_or(Self::Unknown)
    }

    pub fn is_onboarding(&self) -> bool {
        matches!(
            self,
            Self::IsCustomer
                | Self::IsSupplier
                | Self::HasAccount
                | Self::NewUser
                | Self::VerifyAccount
                | Self::Register
        )
    }

    pub fn is_supplier_only(&self) -> bool {
        self.label().starts_with("intent.supplier.")
    }

    /// Order handling acts on a customer's own orders, so guests cannot use it.
    pub fn needs_customer_account(&self) -> bool {
        matches!(
            self,
            Self::PlaceOrder
                | Self::ConfirmOrder
                | Self::SetDeliveryDate
                | Self::SetDeliveryLocation
                | Self::CheckDeliveries
        )
    }

    /// Slots without which the intent cannot be acted on.
    pub fn required_slots(&self) -> &'static [&'static str] {
        match self {
            Self::PlaceOrder => &["product_name", "quantity"],
            Self::ConfirmOrder | Self::AcceptOrder | Self::DeclineOrder => &["order_id"],
            Self::SetDeliveryDate => &["delivery_date"],
            Self::SetDeliveryLocation => &["delivery_location"],
            Self::AddProduct => &["product_name"],
            Self::UpdateInventory | Self::SetQuantity => &["product_name", "quantity"],
            Self::SetPrice => &["product_name", "unit_price"],
            Self::SetExpiryDate => &["product_name", "expiry_date"],
            Self::CheckDeliveriesByDate => &["date"],
            Self::AcceptFlashSale | Self::DeclineFlashSale => &["flash_sale_id"],
            _ => &[],
        }
    }
}

pub type Slots = Map<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    pub slots: Slots,
    /// Optional direct reply suggested by the oracle for no-tool paths.
    pub reply: Option<String>,
}

impl Classification {
    pub fn new(intent: Intent) -> Self {
        Self { intent, slots: Slots::new(), reply: None }
    }

    pub fn with_slot(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.slots.insert(key.to_string(), value.into());
        self
    }

    /// Non-empty string slot; numbers are rendered as strings.
    pub fn slot_str(&self, key: &str) -> Option<String> {
        match self.slots.get(key)? {
            Value::String(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            Value::Number(value) => Some(value.to_string()),
            _ => None,
        }
    }
}

/// Material the oracle may turn into the final reply.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplyDraft {
    pub intent: Intent,
    pub message: String,
    pub tool_calls: Vec<ToolCall>,
    pub fallback: String,
    /// The session's preferred reply language, when known.
    pub language: Option<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OracleError {
    #[error("reasoning oracle unavailable: {0}")]
    Unavailable(String),
    #[error("reasoning oracle call was cancelled")]
    Cancelled,
}

#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    async fn classify(
        &self,
        message: &str,
        session: &Session,
        cancel: &CancellationToken,
    ) -> Result<Classification, OracleError>;

    /// Default keeps the deterministic draft.
    async fn compose_reply(
        &self,
        draft: &ReplyDraft,
        _cancel: &CancellationToken,
    ) -> Result<String, OracleError> {
        Ok(draft.fallback.clone())
    }
}

const CLASSIFY_SYSTEM_PROMPT: &str = "You classify chat messages for KCart, an agricultural \
marketplace serving customers and suppliers. Answer with a single JSON object \
{\"intent\": <label>, \"slots\": {..}, \"reply\": <optional short reply>}. \
Use only these intent labels: ";

const CLASSIFY_SLOT_HINT: &str = "Slot keys: user_name, phone_number, product_name, \
quantity, unit_price, expiry_date, order_id, delivery_date, delivery_location, date, \
flash_sale_id, time_horizon, style, question, language. Set language (English or Amharic) \
when the user writes in or asks for a language. Omit slots you cannot fill.";

const COMPOSE_SYSTEM_PROMPT: &str = "You are KCart's assistant. Write a short, friendly reply \
for the user using only the facts in the tool results. If a tool failed, say that part is \
unavailable instead of guessing. Answer in plain text, in the reply language when one is \
given.";

pub struct LlmOracle {
    client: Arc<dyn LlmClient>,
    transcript_entries: usize,
}

impl LlmOracle {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client, transcript_entries: 6 }
    }

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, OracleError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(OracleError::Cancelled),
            result = self.client.complete(system, prompt) => {
                result.map_err(|error: LlmError| OracleError::Unavailable(error.to_string()))
            }
        }
    }
}

#[async_trait]
impl ReasoningOracle for LlmOracle {
    async fn classify(
        &self,
        message: &str,
        session: &Session,
        cancel: &CancellationToken,
    ) -> Result<Classification, OracleError> {
        let labels = Intent::ALL
            .iter()
            .filter(|intent| **intent != Intent::Unknown)
            .map(Intent::label)
            .collect::<Vec<_>>()
            .join(", ");
        let system = format!("{CLASSIFY_SYSTEM_PROMPT}{labels}. {CLASSIFY_SLOT_HINT}");

        let mut prompt = format!(
            "role: {}\nlogin_state: {}\n",
            session.role.as_str(),
            session.auth_state.as_str()
        );
        if let Some(language) = session.preferred_language.as_deref() {
            prompt.push_str(&format!("preferred_language: {language}\n"));
        }
        for entry in session.recent_transcript(self.transcript_entries) {
            let speaker = if entry.kind == ContextKind::UserMessage { "user" } else { "assistant" };
            let text = entry.content.as_str().unwrap_or_default();
            prompt.push_str(&format!("{speaker}: {text}\n"));
        }
        prompt.push_str(&format!("message: {message}"));

        let raw = self.complete(&system, &prompt, cancel).await?;
        Ok(parse_classification(&raw))
    }

    async fn compose_reply(
        &self,
        draft: &ReplyDraft,
        cancel: &CancellationToken,
    ) -> Result<String, OracleError> {
        let results = serde_json::to_string(&draft.tool_calls).unwrap_or_default();
        let mut prompt = format!(
            "intent: {}\nuser message: {}\ntool results: {}\ndraft reply: {}",
            draft.intent.label(),
            draft.message,
            results,
            draft.fallback
        );
        if let Some(language) = draft.language.as_deref() {
            prompt.push_str(&format!("\nreply language: {language}"));
        }
        let reply = self.complete(COMPOSE_SYSTEM_PROMPT, &prompt, cancel).await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Ok(draft.fallback.clone());
        }
        Ok(reply.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    intent: String,
    #[serde(default)]
    slots: Slots,
    #[serde(default)]
    reply: Option<String>,
}

/// Malformed oracle output degrades to `Unknown` rather than failing the turn.
pub fn parse_classification(raw: &str) -> Classification {
    let body = strip_code_fence(raw);
    let candidate = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => body,
    };

    match serde_json::from_str::<RawClassification>(candidate) {
        Ok(parsed) => {
            let intent = Intent::parse(&parsed.intent);
            debug!(event_name = "oracle.classified", intent = intent.label(), "message classified");
            Classification {
                intent,
                slots: parsed.slots,
                reply: parsed.reply.filter(|reply| !reply.trim().is_empty()),
            }
        }
        Err(error) => {
            warn!(
                event_name = "oracle.malformed_output",
                error = %error,
                "oracle output was not a classification"
            );
            Classification::new(Intent::Unknown)
        }
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
