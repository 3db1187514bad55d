//! The patient-intake record schema.
//!
//! One canonical shape is used regardless of which converter or model
//! produced the record: a flat [`Address`] struct, a [`Pharmacy`] with its
//! own address, typed dates for date of birth and consent, and ordered
//! lists for repeated entities. Every struct rejects unknown fields; fields
//! the model leaves out fall back to their empty value.
//!
//! [`record_json_schema`] renders the same shape as a strict JSON Schema
//! for structured-output capable models.

use chrono::NaiveDate;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Contact {
    pub name: String,
    pub phone: String,
    pub relationship: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Pharmacy {
    pub name: String,
    pub phone: String,
    pub address: Address,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Insurance {
    pub provider: String,
    pub policy_number: String,
    pub group_number: Option<String>,
    pub policyholder_name: String,
    pub relationship_to_patient: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Condition {
    pub name: String,
    pub diagnosed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Medication {
    pub name: String,
    pub dosage: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Allergy {
    pub name: String,
}

/// A past surgery. `date` stays free-form: forms often record only a year.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Surgery {
    pub name: String,
    pub date: String,
}

/// Structured patient information extracted from one intake form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PatientRecord {
    pub name: String,
    #[serde(deserialize_with = "deserialize_optional_date")]
    pub dob: Option<NaiveDate>,
    pub gender: String,
    pub address: Address,
    pub phone: String,
    pub email: String,
    pub preferred_contact_method: String,
    pub emergency_contact: Contact,
    pub insurance: Option<Insurance>,
    pub reason_for_visit: String,
    pub symptoms_duration: String,
    pub past_conditions: Vec<Condition>,
    pub current_medications: Vec<Medication>,
    pub allergies: Vec<Allergy>,
    pub surgeries: Vec<Surgery>,
    pub occupation: Option<String>,
    pub pharmacy: Option<Pharmacy>,
    pub consent_given: bool,
    #[serde(deserialize_with = "deserialize_optional_date")]
    pub consent_date: Option<NaiveDate>,
}

impl PatientRecord {
    /// Parse a model response into a record.
    ///
    /// Accepts a bare JSON object or one wrapped in a fenced code block.
    pub fn from_model_output(output: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(strip_code_fence(output))
    }

    /// Canonical JSON used for storage.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// SHA-256 of the canonical JSON; equal records hash equally.
    pub fn record_hash(&self) -> Result<String, serde_json::Error> {
        Ok(crate::models::fingerprint(self.to_json()?.as_bytes()))
    }
}

fn strip_code_fence(output: &str) -> &str {
    let trimmed = output.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%B %d, %Y", "%b %d, %Y", "%d %B %Y"];

/// Parse the date spellings commonly found on intake forms.
pub fn parse_form_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

fn deserialize_optional_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => parse_form_date(s)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("invalid date '{}'", s))),
    }
}

fn string_field(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

fn nullable_string(description: &str) -> Value {
    json!({ "type": ["string", "null"], "description": description })
}

fn object(properties: Value) -> Value {
    let required: Vec<String> = properties
        .as_object()
        .map(|props| props.keys().cloned().collect())
        .unwrap_or_default();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

fn nullable(mut schema: Value) -> Value {
    if let Some(obj) = schema.as_object_mut() {
        obj.insert("type".to_string(), json!(["object", "null"]));
    }
    schema
}

fn list_of(item: Value) -> Value {
    json!({ "type": "array", "items": item })
}

fn address_schema() -> Value {
    object(json!({
        "street": string_field("Street line, empty if not on the form"),
        "city": string_field("City"),
        "state": string_field("State or region"),
        "zip_code": string_field("Postal code"),
    }))
}

/// Strict JSON Schema describing [`PatientRecord`].
///
/// Every property is listed as required and objects forbid additional
/// properties; optional values are expressed as nullable types, so the
/// model reports absence with `null` instead of omitting or inventing data.
pub fn record_json_schema() -> Value {
    let contact = object(json!({
        "name": string_field("Contact name"),
        "phone": string_field("Contact phone"),
        "relationship": string_field("Relationship to the patient"),
    }));
    let insurance = nullable(object(json!({
        "provider": string_field("Insurance provider"),
        "policy_number": string_field("Policy number"),
        "group_number": nullable_string("Group number, null if absent"),
        "policyholder_name": string_field("Name of the policyholder"),
        "relationship_to_patient": string_field("Policyholder's relationship to the patient"),
    })));
    let pharmacy = nullable(object(json!({
        "name": string_field("Pharmacy name"),
        "phone": string_field("Pharmacy phone"),
        "address": address_schema(),
    })));

    object(json!({
        "name": string_field("Patient full name"),
        "dob": nullable_string("Date of birth as YYYY-MM-DD, null if absent"),
        "gender": string_field("Gender as written on the form"),
        "address": address_schema(),
        "phone": string_field("Patient phone"),
        "email": string_field("Patient email"),
        "preferred_contact_method": string_field("Preferred contact method"),
        "emergency_contact": contact,
        "insurance": insurance,
        "reason_for_visit": string_field("Reason for the visit"),
        "symptoms_duration": string_field("How long symptoms have lasted"),
        "past_conditions": list_of(object(json!({
            "name": string_field("Condition name"),
            "diagnosed": { "type": "boolean", "description": "Whether the condition was diagnosed" },
        }))),
        "current_medications": list_of(object(json!({
            "name": string_field("Medication name"),
            "dosage": string_field("Dosage as written"),
        }))),
        "allergies": list_of(object(json!({
            "name": string_field("Allergen"),
        }))),
        "surgeries": list_of(object(json!({
            "name": string_field("Procedure"),
            "date": string_field("Date as written on the form"),
        }))),
        "occupation": nullable_string("Occupation, null if absent"),
        "pharmacy": pharmacy,
        "consent_given": { "type": "boolean", "description": "Whether consent was given" },
        "consent_date": nullable_string("Consent date as YYYY-MM-DD, null if absent"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> Value {
        json!({
            "name": "Jane Doe",
            "dob": "1980-03-14",
            "gender": "F",
            "address": { "street": "1 Main St", "city": "Springfield", "state": "IL", "zip_code": "62701" },
            "phone": "555-0100",
            "email": "jane@example.com",
            "preferred_contact_method": "phone",
            "emergency_contact": { "name": "John Doe", "phone": "555-0101", "relationship": "spouse" },
            "insurance": null,
            "reason_for_visit": "checkup",
            "symptoms_duration": "",
            "past_conditions": [{ "name": "asthma", "diagnosed": true }],
            "current_medications": [],
            "allergies": [{ "name": "penicillin" }, { "name": "latex" }],
            "surgeries": [],
            "occupation": null,
            "pharmacy": null,
            "consent_given": true,
            "consent_date": "03/01/2024"
        })
    }

    #[test]
    fn parses_record_with_absent_insurance() {
        let record = PatientRecord::from_model_output(&sample_json().to_string()).unwrap();
        assert_eq!(record.name, "Jane Doe");
        assert_eq!(record.dob, NaiveDate::from_ymd_opt(1980, 3, 14));
        assert_eq!(record.consent_date, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert!(record.insurance.is_none());
        assert_eq!(record.allergies[0].name, "penicillin");
        assert_eq!(record.allergies[1].name, "latex");
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut value = sample_json();
        value["favorite_color"] = json!("blue");
        assert!(PatientRecord::from_model_output(&value.to_string()).is_err());

        let mut nested = sample_json();
        nested["address"]["country"] = json!("US");
        assert!(PatientRecord::from_model_output(&nested.to_string()).is_err());
    }

    #[test]
    fn missing_fields_fall_back_to_empty() {
        let record = PatientRecord::from_model_output("{\"name\": \"\"}").unwrap();
        assert_eq!(record, PatientRecord::default());
    }

    #[test]
    fn empty_date_is_absent_and_garbage_date_is_rejected() {
        let record = PatientRecord::from_model_output("{\"dob\": \"\"}").unwrap();
        assert!(record.dob.is_none());
        assert!(PatientRecord::from_model_output("{\"dob\": \"yesterday\"}").is_err());
    }

    #[test]
    fn accepts_fenced_output() {
        let fenced = format!("```json\n{}\n```", sample_json());
        let record = PatientRecord::from_model_output(&fenced).unwrap();
        assert_eq!(record.email, "jane@example.com");
    }

    #[test]
    fn form_date_spellings() {
        let expected = NaiveDate::from_ymd_opt(1980, 3, 14);
        assert_eq!(parse_form_date("1980-03-14"), expected);
        assert_eq!(parse_form_date("03/14/1980"), expected);
        assert_eq!(parse_form_date("March 14, 1980"), expected);
        assert_eq!(parse_form_date("14 March 1980"), expected);
        assert_eq!(parse_form_date("soon"), None);
    }

    #[test]
    fn dates_serialize_as_iso() {
        let record = PatientRecord::from_model_output(&sample_json().to_string()).unwrap();
        let out: Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
        assert_eq!(out["dob"], "1980-03-14");
        assert_eq!(out["insurance"], Value::Null);
    }

    #[test]
    fn record_hash_tracks_content() {
        let a = PatientRecord::from_model_output(&sample_json().to_string()).unwrap();
        let mut b = a.clone();
        assert_eq!(a.record_hash().unwrap(), b.record_hash().unwrap());
        b.phone = "555-9999".to_string();
        assert_ne!(a.record_hash().unwrap(), b.record_hash().unwrap());
    }

    #[test]
    fn json_schema_is_strict() {
        let schema = record_json_schema();
        assert_eq!(schema["additionalProperties"], false);
        let required = schema["required"].as_array().unwrap();
        assert_eq!(required.len(), schema["properties"].as_object().unwrap().len());
        assert!(required.iter().any(|r| r == "insurance"));
        assert_eq!(schema["properties"]["insurance"]["type"], json!(["object", "null"]));
        assert_eq!(
            schema["properties"]["allergies"]["items"]["additionalProperties"],
            false
        );
    }
}
