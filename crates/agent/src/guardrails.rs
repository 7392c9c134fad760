use kcart_core::domain::session::{AuthState, Role};

use crate::oracle::{Classification, Intent};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Deny { reason_code: &'static str, user_message: String, fallback_path: &'static str },
    Degrade { reason_code: &'static str, user_message: String, fallback_path: &'static str },
}

impl GuardrailDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Role gate evaluated before any tool runs. A non-allow decision means the
/// turn answers conversationally with no tool call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailPolicy {
    pub image_generation_enabled: bool,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self { image_generation_enabled: true }
    }
}

impl GuardrailPolicy {
    pub fn evaluate(
        &self,
        role: Role,
        auth_state: AuthState,
        classification: &Classification,
    ) -> GuardrailDecision {
        let intent = classification.intent;
        let supplier_session = role == Role::Supplier && auth_state == AuthState::Authenticated;

        if intent.is_supplier_only() && !supplier_session {
            return GuardrailDecision::Deny {
                reason_code: "supplier_only_intent",
                user_message: "That option is only available to signed-in suppliers. I can help \
                               you check product availability or share storage, nutrition and \
                               seasonal tips."
                    .to_string(),
                fallback_path: "customer_catalog",
            };
        }

        let customer_session = role == Role::Customer && auth_state == AuthState::Authenticated;
        if intent.needs_customer_account() && !customer_session {
            return GuardrailDecision::Deny {
                reason_code: "customer_account_required",
                user_message: "Orders and deliveries need a signed-in customer account. As a \
                               guest you can still browse products and ask for advice."
                    .to_string(),
                fallback_path: "customer_login",
            };
        }

        let missing = intent
            .required_slots()
            .iter()
            .copied()
            .filter(|slot| classification.slot_str(slot).is_none())
            .collect::<Vec<_>>();

        match intent {
            Intent::AcceptFlashSale | Intent::DeclineFlashSale if !missing.is_empty() => {
                GuardrailDecision::Degrade {
                    reason_code: "missing_flash_sale_id",
                    user_message: "Which flash sale do you mean? Ask me to show your flash \
                                   sales and I'll list the open proposals with their ids."
                        .to_string(),
                    fallback_path: "list_flash_sales",
                }
            }
            Intent::GenerateProductImage if !self.image_generation_enabled => {
                GuardrailDecision::Degrade {
                    reason_code: "image_generation_disabled",
                    user_message: "Image generation is switched off right now.".to_string(),
                    fallback_path: "describe_product",
                }
            }
            _ if !missing.is_empty() => {
                let details = missing.iter().map(|slot| slot.replace('_', " ")).collect::<Vec<_>>();
                GuardrailDecision::Degrade {
                    reason_code: "missing_slot",
                    user_message: format!("I can do that once I know the {}.", details.join(" and ")),
                    fallback_path: "ask_for_details",
                }
            }
            _ => GuardrailDecision::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use kcart_core::domain::session::{AuthState, Role};

    use super::{GuardrailDecision, GuardrailPolicy};
    use crate::oracle::{Classification, Intent};

    #[test]
    fn customer_intents_are_open_to_guests() {
        let decision = GuardrailPolicy::default().evaluate(
            Role::Guest,
            AuthState::Guest,
            &Classification::new(Intent::StorageAdvice),
        );
        assert_eq!(decision, GuardrailDecision::Allow);
    }

    #[test]
    fn supplier_intents_are_denied_to_customers() {
        let decision = GuardrailPolicy::default().evaluate(
            Role::Customer,
            AuthState::Authenticated,
            &Classification::new(Intent::SalesSummary),
        );

        let (reason_code, user_message, fallback_path) = match decision {
            GuardrailDecision::Deny { reason_code, user_message, fallback_path } => {
                (reason_code, user_message, fallback_path)
            }
            _ => ("", String::new(), ""),
        };

        assert_eq!(reason_code, "supplier_only_intent");
        assert!(user_message.contains("only available to signed-in suppliers"));
        assert_eq!(fallback_path, "customer_catalog");
    }

    #[test]
    fn flash_sale_resolution_needs_an_id() {
        let policy = GuardrailPolicy::default();
        let missing = policy.evaluate(
            Role::Supplier,
            AuthState::Authenticated,
            &Classification::new(Intent::AcceptFlashSale),
        );
        assert!(matches!(
            missing,
            GuardrailDecision::Degrade { reason_code: "missing_flash_sale_id", .. }
        ));

        let present = policy.evaluate(
            Role::Supplier,
            AuthState::Authenticated,
            &Classification::new(Intent::AcceptFlashSale).with_slot("flash_sale_id", "fs-1"),
        );
        assert!(present.is_allowed());
    }

    #[test]
    fn orders_need_a_signed_in_customer() {
        let policy = GuardrailPolicy::default();
        let order = Classification::new(Intent::PlaceOrder)
            .with_slot("product_name", "teff")
            .with_slot("quantity", 5);

        let guest = policy.evaluate(Role::Guest, AuthState::Guest, &order);
        assert!(matches!(
            guest,
            GuardrailDecision::Deny { reason_code: "customer_account_required", .. }
        ));
        let supplier = policy.evaluate(Role::Supplier, AuthState::Authenticated, &order);
        assert!(!supplier.is_allowed());

        assert!(policy.evaluate(Role::Customer, AuthState::Authenticated, &order).is_allowed());
    }

    #[test]
    fn missing_details_are_asked_for() {
        let decision = GuardrailPolicy::default().evaluate(
            Role::Supplier,
            AuthState::Authenticated,
            &Classification::new(Intent::SetPrice).with_slot("product_name", "onion"),
        );

        match decision {
            GuardrailDecision::Degrade { reason_code, user_message, fallback_path } => {
                assert_eq!(reason_code, "missing_slot");
                assert_eq!(user_message, "I can do that once I know the unit price.");
                assert_eq!(fallback_path, "ask_for_details");
            }
            other => panic!("expected a degrade, got {other:?}"),
        }
    }
}
