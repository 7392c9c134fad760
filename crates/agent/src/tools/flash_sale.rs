use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kcart_core::domain::flash_sale::{
    FlashSaleProposal, NewProposal, ProposalId, ProposalStatus,
};
use kcart_core::domain::tool::ToolName;
use kcart_core::flows::{FlashSaleBook, FlashSaleError, FlashSaleEvent};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{input_str, StagedChange, Tool, ToolContext, ToolError, ToolInput, ToolOutput};

/// `flash_sale_manager`: proposes clearance sales for expiring stock and lets
/// a supplier list, accept and reject them. Writes are staged on the turn and
/// only reach the book when the turn commits.
pub struct FlashSaleTool {
    book: Arc<FlashSaleBook>,
}

impl FlashSaleTool {
    pub fn new(book: Arc<FlashSaleBook>) -> Self {
        Self { book }
    }

    fn list(
        &self,
        supplier_id: &str,
        input: &ToolInput,
        context: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let status = match input_str(input, "status") {
            Some(raw) if raw.eq_ignore_ascii_case("all") => None,
            Some(raw) => Some(
                ProposalStatus::parse(raw)
                    .ok_or_else(|| ToolError::invalid_input(format!("unknown status `{raw}`")))?,
            ),
            None => Some(ProposalStatus::Pending),
        };

        let drafted = self.draft_from_inventory(supplier_id, input, context)?;
        let mut proposals = self.book.list_for_supplier(supplier_id, status, context.now);
        if status.map_or(true, |status| status == ProposalStatus::Pending) {
            proposals.extend(drafted.iter().cloned());
        }

        let mut output = ToolOutput::new();
        output.insert("count".to_string(), json!(proposals.len()));
        output.insert("generated".to_string(), json!(drafted.len()));
        output.insert(
            "proposals".to_string(),
            Value::Array(proposals.iter().map(serialize_proposal).collect()),
        );
        Ok(output)
    }

    /// Drafts a proposal for every expiring item that has no open proposal yet
    /// and stages it for creation.
    fn draft_from_inventory(
        &self,
        supplier_id: &str,
        input: &ToolInput,
        context: &ToolContext,
    ) -> Result<Vec<FlashSaleProposal>, ToolError> {
        let items = match input.get("expiring_items") {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Array(items)) => items,
            Some(_) => return Err(ToolError::invalid_input("expiring_items must be a list")),
        };
        let within_days = input.get("within_days").and_then(Value::as_i64);

        let mut seen = HashSet::new();
        let mut drafted = Vec::new();
        for item in items.iter().filter_map(Value::as_object) {
            let Some(request) = clearance_request(supplier_id, item, within_days) else {
                debug!(
                    event_name = "flash_sale.item_skipped",
                    correlation_id = %context.correlation_id,
                    "expiring item has no usable product reference"
                );
                continue;
            };
            if !seen.insert(request.product_ref.clone())
                || self.book.find_open(supplier_id, &request.product_ref, context.now).is_some()
            {
                continue;
            }

            let proposal = self.book.draft(request, context.now);
            context.staged.stage(BookWrite {
                book: Arc::clone(&self.book),
                write: Write::Open(proposal.clone()),
                now: context.now,
            });
            drafted.push(proposal);
        }

        if !drafted.is_empty() {
            info!(
                event_name = "flash_sale.drafted",
                correlation_id = %context.correlation_id,
                session_id = %context.session_id,
                supplier_id,
                drafted = drafted.len(),
                "flash sale proposals drafted from expiring inventory"
            );
        }
        Ok(drafted)
    }

    fn resolve(
        &self,
        supplier_id: &str,
        event: FlashSaleEvent,
        input: &ToolInput,
        context: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let id = input_str(input, "flash_sale_id")
            .map(|raw| ProposalId(raw.to_string()))
            .ok_or_else(|| ToolError::invalid_input("flash_sale_id is required for accept/reject"))?;

        // another supplier's proposal reads as missing
        let current = self.book.get(&id, context.now).map_err(flash_sale_error)?;
        if current.supplier_id != supplier_id {
            return Err(flash_sale_error(FlashSaleError::NotFound(id)));
        }

        let projected = self.book.preview(&id, event, context.now).map_err(flash_sale_error)?;
        context.staged.stage(BookWrite {
            book: Arc::clone(&self.book),
            write: Write::Resolve { id: id.clone(), event },
            now: context.now,
        });

        info!(
            event_name = "flash_sale.tool_staged",
            correlation_id = %context.correlation_id,
            session_id = %context.session_id,
            proposal_id = %id,
            status = projected.status.as_str(),
            "flash sale resolution staged through chat"
        );

        match serialize_proposal(&projected) {
            Value::Object(map) => Ok(map),
            _ => Err(ToolError::execution("proposal did not serialize to an object")),
        }
    }
}

#[async_trait]
impl Tool for FlashSaleTool {
    fn name(&self) -> ToolName {
        ToolName::FlashSaleManager
    }

    async fn invoke(
        &self,
        input: &ToolInput,
        context: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let action = input_str(input, "action")
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| ToolError::invalid_input("action is required"))?;
        let supplier_id = acting_supplier(input, context)?;

        match action.as_str() {
            "list_proposals" => self.list(&supplier_id, input, context),
            "accept" => self.resolve(&supplier_id, FlashSaleEvent::Accept, input, context),
            "reject" | "decline" => {
                self.resolve(&supplier_id, FlashSaleEvent::Reject, input, context)
            }
            other => Err(ToolError::invalid_input(format!("unsupported action `{other}`"))),
        }
    }
}

/// The signed-in supplier always acts for themselves; naming anyone else is
/// refused rather than honoured.
fn acting_supplier(input: &ToolInput, context: &ToolContext) -> Result<String, ToolError> {
    let session_supplier = context
        .supplier_id()
        .ok_or_else(|| ToolError::invalid_input("flash sales need a signed-in supplier"))?;
    match input_str(input, "supplier_id") {
        Some(named) if named != session_supplier => Err(ToolError::invalid_input(format!(
            "supplier_id `{named}` does not match the signed-in supplier"
        ))),
        _ => Ok(session_supplier.to_string()),
    }
}

enum Write {
    Open(FlashSaleProposal),
    Resolve { id: ProposalId, event: FlashSaleEvent },
}

struct BookWrite {
    book: Arc<FlashSaleBook>,
    write: Write,
    now: DateTime<Utc>,
}

impl StagedChange for BookWrite {
    fn tool(&self) -> ToolName {
        ToolName::FlashSaleManager
    }

    fn commit(&self) -> Result<(), ToolError> {
        match &self.write {
            Write::Open(proposal) => {
                self.book.open(proposal.clone(), self.now);
                Ok(())
            }
            Write::Resolve { id, event } => self
                .book
                .resolve(id, *event, self.now)
                .map(|_| ())
                .map_err(flash_sale_error),
        }
    }
}

/// Clearance tiers by days left on the shelf: 30% at a day or less, 20% at
/// two days, 10% otherwise.
pub fn clearance_discount(expires_in_days: Option<i64>) -> Decimal {
    match expires_in_days {
        Some(days) if days <= 1 => Decimal::new(30, 0),
        Some(2) => Decimal::new(20, 0),
        _ => Decimal::new(10, 0),
    }
}

fn clearance_request(
    supplier_id: &str,
    item: &Map<String, Value>,
    within_days: Option<i64>,
) -> Option<NewProposal> {
    let text = |key: &str| {
        item.get(key).and_then(Value::as_str).map(str::trim).filter(|value| !value.is_empty())
    };
    let product_ref = text("product")
        .or_else(|| text("product_name"))
        .or_else(|| text("name"))
        .or_else(|| text("product_id"))?
        .to_string();

    let expires_in_days = item.get("expires_in_days").and_then(Value::as_i64);
    if let (Some(days), Some(horizon)) = (expires_in_days, within_days) {
        if days > horizon {
            return None;
        }
    }

    let discount = clearance_discount(expires_in_days);
    let proposed_price = ["unit_price", "price"]
        .iter()
        .find_map(|key| item.get(*key).and_then(decimal_value))
        .filter(|price| price.is_sign_positive() && !price.is_zero())
        .map(|price| {
            let mut discounted =
                (price * (Decimal::ONE_HUNDRED - discount) / Decimal::ONE_HUNDRED).round_dp(2);
            discounted.rescale(2);
            discounted
        });

    Some(NewProposal {
        supplier_id: supplier_id.to_string(),
        product_ref,
        proposed_price,
        discount_percent: Some(discount),
    })
}

fn decimal_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(raw) => Decimal::from_str(raw.trim()).ok(),
        Value::Number(number) => Decimal::from_str(&number.to_string()).ok(),
        _ => None,
    }
}

fn flash_sale_error(error: FlashSaleError) -> ToolError {
    ToolError::new(error.code(), error.to_string())
}

fn serialize_proposal(proposal: &FlashSaleProposal) -> Value {
    json!({
        "id": proposal.id.0,
        "product": proposal.product_ref,
        "proposed_price": proposal.proposed_price.map(|price| price.to_string()),
        "discount_percent": proposal.discount_percent.map(|discount| discount.to_string()),
        "status": proposal.status.as_str(),
        "created_at": proposal.created_at.to_rfc3339(),
        "expires_at": proposal.expires_at.to_rfc3339(),
    })
}
