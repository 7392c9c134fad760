use serde::{Deserialize, Serialize};

use crate::domain::session::Role;

/// Reference to an externally owned customer or supplier account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub account_id: String,
    pub name: String,
    pub phone: String,
    pub role: Role,
}

/// Name and phone pair collected during login, normalised for lookup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub name: String,
    pub phone: String,
}

impl Credentials {
    pub fn new(name: &str, phone: &str) -> Option<Self> {
        let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
        let phone = normalize_phone(phone);
        if name.is_empty() || phone.is_empty() {
            return None;
        }
        Some(Self { name, phone })
    }
}

/// Strips separators so `+251 911-000 111` and `+251911000111` compare equal.
pub fn normalize_phone(raw: &str) -> String {
    let mut phone = String::with_capacity(raw.len());
    for (index, ch) in raw.trim().chars().enumerate() {
        if ch.is_ascii_digit() || (index == 0 && ch == '+') {
            phone.push(ch);
        }
    }
    phone
}
