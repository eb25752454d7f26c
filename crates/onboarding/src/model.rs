//! Onboarding domain model.

use serde::{Deserialize, Serialize};

/// How a patient prefers to be contacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContactMethod {
    /// Notified at the patient's email address.
    #[default]
    Phone,
    /// Notified by text message to the patient's phone.
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hospital {
    pub name: String,
    pub zip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doctor {
    pub name: String,
    pub specialty: String,
}

/// A patient being onboarded.
///
/// `id` identifies the onboarding execution; `name` is the primary key of
/// the `patients` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub zip: String,
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub contact_method: ContactMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hospital: Option<Hospital>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor: Option<Doctor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onboarded: Option<String>,
}

impl Patient {
    /// Create a patient with only the identifying fields set.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            zip: String::new(),
            condition: String::new(),
            email: String::new(),
            phone: String::new(),
            contact_method: ContactMethod::default(),
            hospital: None,
            doctor: None,
            onboarded: None,
        }
    }

    #[must_use]
    pub fn with_zip(mut self, zip: impl Into<String>) -> Self {
        self.zip = zip.into();
        self
    }

    #[must_use]
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = email.into();
        self
    }

    #[must_use]
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = phone.into();
        self
    }

    #[must_use]
    pub const fn with_contact_method(mut self, contact_method: ContactMethod) -> Self {
        self.contact_method = contact_method;
        self
    }

    /// The address used for the preferred contact method.
    #[must_use]
    pub fn contact_address(&self) -> &str {
        match self.contact_method {
            ContactMethod::Phone => &self.email,
            ContactMethod::Text => &self.phone,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::indexing_slicing)]

    use super::*;
    use serde_json::json;

    #[test]
    fn test_patient_wire_format() {
        let patient: Patient = serde_json::from_value(json!({
            "id": "p-1",
            "name": "Alice",
            "zip": "90210",
            "contactMethod": "TEXT",
            "phone": "555-0100"
        }))
        .unwrap();

        assert_eq!(patient.contact_method, ContactMethod::Text);
        assert_eq!(patient.contact_address(), "555-0100");
        assert!(patient.onboarded.is_none());

        let back = serde_json::to_value(&patient).unwrap();
        assert_eq!(back["contactMethod"], json!("TEXT"));
        assert!(back.get("hospital").is_none());
    }

    #[test]
    fn test_phone_preference_uses_email() {
        let patient = Patient::new("p-2", "Bob").with_email("bob@example.com");
        assert_eq!(patient.contact_address(), "bob@example.com");
    }
}
