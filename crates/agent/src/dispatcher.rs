//! Intent router.
//!
//! An intent expands to a fixed, ordered plan of tool calls. Calls run one at
//! a time because a later step may read an earlier step's output (pricing
//! insight needs the product id resolved by the catalogue lookup, and flash
//! sale proposals are drafted from the expiring inventory listed before them).
//! Every step lands in the trace, failed or not, in plan order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kcart_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use kcart_core::domain::session::Session;
use kcart_core::domain::tool::ToolName;
use kcart_core::domain::trace::{ToolCall, ToolFailure, ToolOutcome, TurnTrace};
use kcart_core::errors::ErrorCode;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::oracle::{Classification, Intent};
use crate::tools::{ToolContext, ToolError, ToolInput, ToolRegistry};

/// Copies a field of an earlier step's output into this step's input. A
/// required binding that cannot be satisfied fails the step; an optional one
/// is skipped and the step runs without it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub source: ToolName,
    pub output_field: &'static str,
    pub input_field: &'static str,
    pub required: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlannedCall {
    pub tool: ToolName,
    pub input: ToolInput,
    pub binding: Option<Binding>,
}

impl PlannedCall {
    fn new(tool: ToolName, input: ToolInput) -> Self {
        Self { tool, input, binding: None }
    }

    fn bound(mut self, binding: Binding) -> Self {
        self.binding = Some(binding);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dispatch {
    pub fragments: Vec<String>,
    pub trace: TurnTrace,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("tool dispatch was cancelled")]
    Cancelled,
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    tool_timeout: Duration,
    audit: Arc<dyn AuditSink>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, tool_timeout: Duration, audit: Arc<dyn AuditSink>) -> Self {
        Self { registry, tool_timeout, audit }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn dispatch(
        &self,
        classification: &Classification,
        message: &str,
        session: &Session,
        context: &ToolContext,
    ) -> Result<Dispatch, DispatchError> {
        self.run(plan(classification, message, session), context).await
    }

    /// Runs a plan in order. Cancellation drops the whole dispatch, including
    /// entries already recorded, so a cancelled turn reports no trace.
    pub async fn run(
        &self,
        plan: Vec<PlannedCall>,
        context: &ToolContext,
    ) -> Result<Dispatch, DispatchError> {
        let mut dispatch = Dispatch::default();

        for step in plan {
            if context.cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            let sequence = dispatch.trace.next_sequence();
            let started_at = Utc::now();
            let clock = Instant::now();
            let mut input = step.input;

            let outcome = match bind_input(step.binding.as_ref(), &dispatch.trace, &mut input) {
                Err(failure) => ToolOutcome::Error(failure),
                Ok(()) => self.invoke(step.tool, &input, context).await?,
            };

            let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
            let call = ToolCall::new(sequence, step.tool, input, outcome, started_at, duration_ms);
            self.observe(&call, context);
            dispatch.fragments.push(describe(&call));
            dispatch.trace.record(call);
        }

        Ok(dispatch)
    }

    async fn invoke(
        &self,
        name: ToolName,
        input: &ToolInput,
        context: &ToolContext,
    ) -> Result<ToolOutcome, DispatchError> {
        let Some(tool) = self.registry.get(name) else {
            return Ok(ToolOutcome::Error(ToolError::unavailable(name).into()));
        };

        let call = tokio::time::timeout(self.tool_timeout, tool.invoke(input, context));
        tokio::select! {
            biased;
            _ = context.cancel.cancelled() => Err(DispatchError::Cancelled),
            result = call => Ok(match result {
                Ok(Ok(output)) => ToolOutcome::Output(Value::Object(output)),
                Ok(Err(error)) => ToolOutcome::Error(error.into()),
                Err(_) => ToolOutcome::Error(ToolError::timeout(name).into()),
            }),
        }
    }

    fn observe(&self, call: &ToolCall, context: &ToolContext) {
        match &call.error {
            None => info!(
                event_name = "tool.completed",
                correlation_id = %context.correlation_id,
                session_id = %context.session_id,
                tool = call.tool_name.as_str(),
                sequence = call.sequence,
                duration_ms = call.duration_ms,
                "tool call completed"
            ),
            Some(failure) => {
                warn!(
                    event_name = "tool.failed",
                    correlation_id = %context.correlation_id,
                    session_id = %context.session_id,
                    tool = call.tool_name.as_str(),
                    sequence = call.sequence,
                    code = %failure.code,
                    error = %failure.error,
                    "tool call failed; continuing turn"
                );
                self.audit.emit(
                    AuditEvent::new(
                        Some(context.session_id.to_string()),
                        context.correlation_id.clone(),
                        "tool.failed",
                        AuditCategory::Tool,
                        call.tool_name.as_str(),
                        AuditOutcome::Failed,
                    )
                    .with_metadata("code", failure.code.clone())
                    .with_metadata("sequence", call.sequence.to_string()),
                );
            }
        }
    }
}

fn bind_input(
    binding: Option<&Binding>,
    trace: &TurnTrace,
    input: &mut ToolInput,
) -> Result<(), ToolFailure> {
    let Some(binding) = binding else {
        return Ok(());
    };

    let value = trace
        .last_output(binding.source)
        .and_then(|output| output.get(binding.output_field))
        .filter(|value| value.is_string() || value.is_number() || value.is_array())
        .cloned();
    match value {
        Some(value) => {
            input.insert(binding.input_field.to_string(), value);
            Ok(())
        }
        None if !binding.required => Ok(()),
        None => Err(ToolFailure {
            code: ErrorCode::DependencyUnavailable.as_str().to_string(),
            error: format!("{} did not provide `{}`", binding.source, binding.output_field),
        }),
    }
}

/// Builds the ordered tool plan for an intent. Onboarding and unknown intents
/// have no plan and are answered directly.
pub fn plan(classification: &Classification, message: &str, session: &Session) -> Vec<PlannedCall> {
    let account_id = session.account_id();
    let action = |name: &str| {
        let mut input = ToolInput::new();
        input.insert("action".to_string(), json!(name));
        input
    };
    let with_slot = |mut input: ToolInput, slot: &str| {
        if let Some(value) = classification.slot_str(slot) {
            input.insert(slot.to_string(), json!(value));
        } else if let Some(items) = classification.slots.get(slot).filter(|value| value.is_array()) {
            input.insert(slot.to_string(), items.clone());
        }
        input
    };
    let with_supplier = |mut input: ToolInput| {
        if let Some(id) = account_id {
            input.insert("supplier_id".to_string(), json!(id));
        }
        input
    };
    let with_customer = |mut input: ToolInput| {
        if let Some(id) = account_id {
            input.insert("customer_id".to_string(), json!(id));
        }
        input
    };
    let with_slots = |input: ToolInput, slots: &[&str]| {
        slots.iter().fold(input, |input, slot| with_slot(input, slot))
    };
    let data_access = |input: ToolInput| vec![PlannedCall::new(ToolName::DataAccess, input)];

    match classification.intent {
        Intent::CheckAvailability => vec![PlannedCall::new(
            ToolName::DataAccess,
            with_slot(with_slot(action("product_availability"), "product_name"), "quantity"),
        )],
        Intent::CheckStock => vec![PlannedCall::new(
            ToolName::DataAccess,
            with_slot(with_supplier(action("supplier_stock")), "product_name"),
        )],
        Intent::ViewExpiringProducts => {
            let within_days = horizon_days(classification.slot_str("time_horizon").as_deref());
            let mut inventory = with_supplier(action("expiring_inventory"));
            inventory.insert("within_days".to_string(), json!(within_days));
            let mut proposals = action("list_proposals");
            proposals.insert("within_days".to_string(), json!(within_days));
            vec![
                PlannedCall::new(ToolName::DataAccess, inventory),
                PlannedCall::new(ToolName::FlashSaleManager, proposals).bound(Binding {
                    source: ToolName::DataAccess,
                    output_field: "items",
                    input_field: "expiring_items",
                    required: false,
                }),
            ]
        }
        Intent::RequestPricingInsight => vec![
            PlannedCall::new(
                ToolName::DataAccess,
                with_slot(action("resolve_product"), "product_name"),
            ),
            PlannedCall::new(ToolName::AnalyticsData, with_supplier(action("competitor_prices")))
                .bound(Binding {
                    source: ToolName::DataAccess,
                    output_field: "product_id",
                    input_field: "product_id",
                    required: true,
                }),
        ],
        Intent::SalesSummary => vec![PlannedCall::new(
            ToolName::AnalyticsData,
            with_slot(with_supplier(action("sales_summary")), "time_horizon"),
        )],
        Intent::ViewFlashSales => {
            vec![PlannedCall::new(ToolName::FlashSaleManager, action("list_proposals"))]
        }
        Intent::AcceptFlashSale => vec![PlannedCall::new(
            ToolName::FlashSaleManager,
            with_slot(action("accept"), "flash_sale_id"),
        )],
        Intent::DeclineFlashSale => vec![PlannedCall::new(
            ToolName::FlashSaleManager,
            with_slot(action("reject"), "flash_sale_id"),
        )],
        Intent::PlaceOrder => data_access(with_slots(
            with_customer(action("place_order")),
            &["product_name", "quantity", "order_items", "delivery_date"],
        )),
        Intent::ConfirmOrder => {
            data_access(with_slots(with_customer(action("confirm_order")), &["order_id"]))
        }
        Intent::SetDeliveryDate => data_access(with_slots(
            with_customer(action("set_delivery_date")),
            &["delivery_date", "order_id"],
        )),
        Intent::SetDeliveryLocation => data_access(with_slots(
            with_customer(action("set_delivery_location")),
            &["delivery_location", "order_id"],
        )),
        Intent::CheckDeliveries => data_access(with_slots(
            with_customer(action("customer_deliveries")),
            &["date", "order_id"],
        )),
        Intent::AddProduct => data_access(with_slots(
            with_supplier(action("add_product")),
            &["product_name", "quantity", "unit_price", "expiry_date"],
        )),
        Intent::UpdateInventory => data_access(with_slots(
            with_supplier(action("update_inventory")),
            &["product_name", "quantity"],
        )),
        Intent::SetQuantity => data_access(with_slots(
            with_supplier(action("set_quantity")),
            &["product_name", "quantity"],
        )),
        Intent::SetPrice => data_access(with_slots(
            with_supplier(action("set_price")),
            &["product_name", "unit_price"],
        )),
        Intent::SetExpiryDate => data_access(with_slots(
            with_supplier(action("set_expiry_date")),
            &["product_name", "expiry_date"],
        )),
        Intent::AcceptOrder => {
            data_access(with_slots(with_supplier(action("accept_order")), &["order_id"]))
        }
        Intent::DeclineOrder => data_access(with_slots(
            with_supplier(action("decline_order")),
            &["order_id", "reason"],
        )),
        Intent::ViewDeliverySchedule => {
            let mut input = with_supplier(action("delivery_schedule"));
            input.insert(
                "within_days".to_string(),
                json!(horizon_days(classification.slot_str("time_horizon").as_deref())),
            );
            data_access(input)
        }
        Intent::CheckDeliveriesByDate => {
            data_access(with_slots(with_supplier(action("deliveries_by_date")), &["date"]))
        }
        Intent::StorageAdvice
        | Intent::NutritionQuery
        | Intent::SeasonalQuery
        | Intent::GeneralAdvisory => {
            let topic = match classification.intent {
                Intent::StorageAdvice => "storage",
                Intent::NutritionQuery => "nutrition",
                Intent::SeasonalQuery => "seasonal",
                _ => "general",
            };
            let mut input = with_slot(ToolInput::new(), "product_name");
            let query = classification.slot_str("question").unwrap_or_else(|| message.to_string());
            input.insert("query".to_string(), json!(query));
            input.insert("topic".to_string(), json!(topic));
            input.insert("top_k".to_string(), json!(3));
            vec![PlannedCall::new(ToolName::VectorSearch, input)]
        }
        Intent::GenerateProductImage => {
            let mut input = with_slot(ToolInput::new(), "product_name");
            let style =
                classification.slot_str("style").unwrap_or_else(|| "photorealistic".to_string());
            input.insert("style".to_string(), json!(style));
            vec![PlannedCall::new(ToolName::ImageGenerator, input)]
        }
        Intent::IsCustomer
        | Intent::IsSupplier
        | Intent::HasAccount
        | Intent::NewUser
        | Intent::VerifyAccount
        | Intent::Register
        | Intent::Unknown => Vec::new(),
    }
}

/// `"5 days"`, `"7"`, `"next week"`; defaults to 3 and stays within 1..=14.
fn horizon_days(raw: Option<&str>) -> u32 {
    let Some(raw) = raw.map(str::to_ascii_lowercase) else {
        return 3;
    };
    let digits = raw.chars().skip_while(|ch| !ch.is_ascii_digit()).take_while(char::is_ascii_digit);
    let days = match digits.collect::<String>().parse::<u32>() {
        Ok(days) if raw.contains("week") => days.saturating_mul(7),
        Ok(days) => days,
        Err(_) if raw.contains("week") => 7,
        Err(_) => 3,
    };
    days.clamp(1, 14)
}

fn tool_label(tool: ToolName) -> &'static str {
    match tool {
        ToolName::DataAccess => "the product catalogue",
        ToolName::AnalyticsData => "market analytics",
        ToolName::FlashSaleManager => "flash sales",
        ToolName::VectorSearch => "the knowledge base",
        ToolName::ImageGenerator => "the image generator",
    }
}

/// Reply fragment for a failed call or a staged change that could not be
/// applied.
pub fn describe_failure(tool: ToolName, code: &str) -> String {
    let label = tool_label(tool);
    match code {
        "already_resolved" => {
            "That flash sale was already resolved earlier, so I left it unchanged.".to_string()
        }
        "proposal_expired" => {
            "That flash sale proposal has expired and can no longer be changed.".to_string()
        }
        "proposal_not_found" => "I couldn't find that flash sale among your proposals.".to_string(),
        "dependency_unavailable" => {
            format!("I couldn't work out which product you meant, so I skipped {label}.")
        }
        "tool_timeout" => {
            format!("Sorry, {label} took too long to answer, so that part is missing.")
        }
        _ => format!("I couldn't reach {label} right now, so this answer may be incomplete."),
    }
}

/// Deterministic reply fragment for one trace entry.
pub fn describe(call: &ToolCall) -> String {
    if let Some(failure) = &call.error {
        return describe_failure(call.tool_name, &failure.code);
    }

    let output = call.output.as_ref().unwrap_or(&Value::Null);
    for key in ["summary", "answer", "message"] {
        if let Some(text) = output.get(key).and_then(Value::as_str) {
            return text.to_string();
        }
    }

    match call.tool_name {
        ToolName::FlashSaleManager => describe_flash_sales(output),
        ToolName::VectorSearch => {
            let passages = output
                .get("results")
                .or_else(|| output.get("result"))
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| {
                            item.get("text").and_then(Value::as_str).or_else(|| item.as_str())
                        })
                        .take(3)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            if passages.is_empty() {
                "I didn't find anything relevant in the knowledge base.".to_string()
            } else {
                passages.join(" ")
            }
        }
        ToolName::ImageGenerator => match output.get("image_url").and_then(Value::as_str) {
            Some(url) => format!("Here is the generated image: {url}"),
            None => "The image was generated.".to_string(),
        },
        ToolName::DataAccess | ToolName::AnalyticsData => {
            summarize_record(tool_label(call.tool_name), output)
        }
    }
}

const LIST_FIELDS: [&str; 6] = ["items", "products", "orders", "deliveries", "results", "rows"];
const NAME_FIELDS: [&str; 6] = ["product", "product_name", "name", "order_id", "product_id", "id"];
const SUMMARY_ENTRIES: usize = 5;

/// Plain-language rendering of a catalogue or analytics answer. Lists show
/// their first few entries by name; flat records show their scalar fields.
fn summarize_record(label: &str, output: &Value) -> String {
    let list = LIST_FIELDS.iter().find_map(|key| output.get(*key).and_then(Value::as_array));
    if let Some(entries) = list {
        if entries.is_empty() {
            return format!("Nothing matched in {label}.");
        }
        let shown = entries.iter().take(SUMMARY_ENTRIES).map(summarize_entry).collect::<Vec<_>>();
        let more = entries.len() - shown.len();
        let tail = if more > 0 { format!(" and {more} more") } else { String::new() };
        return format!("From {label}: {}{tail}.", shown.join("; "));
    }

    let facts = output
        .as_object()
        .map(|fields| {
            fields
                .iter()
                .filter_map(|(key, value)| {
                    scalar_text(value).map(|text| format!("{} {text}", humanize(key)))
                })
                .take(SUMMARY_ENTRIES)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if facts.is_empty() {
        return format!("Nothing came back from {label}.");
    }
    format!("From {label}: {}.", facts.join(", "))
}

fn summarize_entry(entry: &Value) -> String {
    let Some(fields) = entry.as_object() else {
        return scalar_text(entry).unwrap_or_else(|| "an entry".to_string());
    };
    let name = NAME_FIELDS
        .iter()
        .find_map(|key| fields.get(*key).and_then(scalar_text))
        .unwrap_or_else(|| "an entry".to_string());

    let mut details = Vec::new();
    if let Some(quantity) = fields.get("quantity").and_then(scalar_text) {
        match fields.get("unit").and_then(Value::as_str) {
            Some(unit) => details.push(format!("{quantity} {unit}")),
            None => details.push(quantity),
        }
    }
    let price = ["unit_price", "price"].iter().find_map(|key| fields.get(*key).and_then(scalar_text));
    if let Some(price) = price {
        details.push(format!("at {price}"));
    }
    if let Some(days) = fields.get("expires_in_days").and_then(Value::as_i64) {
        details.push(match days {
            days if days <= 0 => "expires today".to_string(),
            1 => "expires in 1 day".to_string(),
            days => format!("expires in {days} days"),
        });
    }
    for key in ["status", "delivery_date", "date"] {
        if let Some(value) = fields.get(key).and_then(scalar_text) {
            details.push(format!("{} {value}", humanize(key)));
        }
    }

    if details.is_empty() {
        name
    } else {
        format!("{name} ({})", details.join(", "))
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(if *flag { "yes" } else { "no" }.to_string()),
        _ => None,
    }
}

fn humanize(key: &str) -> String {
    key.replace('_', " ")
}

fn describe_flash_sales(output: &Value) -> String {
    if let Some(proposals) = output.get("proposals").and_then(Value::as_array) {
        if proposals.is_empty() {
            return "You have no open flash sale proposals right now.".to_string();
        }
        let lines = proposals
            .iter()
            .map(|proposal| {
                let field = |key: &str| proposal.get(key).and_then(Value::as_str);
                let mut terms = Vec::new();
                if let Some(price) = field("proposed_price") {
                    terms.push(format!("at {price}"));
                }
                if let Some(discount) = field("discount_percent") {
                    terms.push(format!("{discount}% off"));
                }
                terms.push(format!("expires {}", field("expires_at").unwrap_or("soon")));
                format!(
                    "{} ({} {})",
                    field("id").unwrap_or("?"),
                    field("product").unwrap_or("product"),
                    terms.join(", ")
                )
            })
            .collect::<Vec<_>>();
        let plural = if lines.len() == 1 { "" } else { "s" };
        let drafted = match output.get("generated").and_then(Value::as_u64) {
            Some(0) | None => String::new(),
            Some(1) => "I drafted 1 new flash sale from your expiring stock. ".to_string(),
            Some(count) => {
                format!("I drafted {count} new flash sales from your expiring stock. ")
            }
        };
        return format!(
            "{drafted}You have {} open flash sale proposal{plural}: {}.",
            lines.len(),
            lines.join("; ")
        );
    }

    let id = output.get("id").and_then(Value::as_str).unwrap_or("the flash sale");
    let status = output.get("status").and_then(Value::as_str).unwrap_or("updated");
    format!("Flash sale {id} is now {status}.")
}
