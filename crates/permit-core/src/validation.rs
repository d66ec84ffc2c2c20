//! Input validation for citizen submissions.

use serde::Deserialize;

use crate::model::{ApplicationType, NewApplicant};

const NAME_MIN: usize = 2;
const NAME_MAX: usize = 100;
const PHONE_MIN_DIGITS: usize = 10;
const PHONE_MAX_DIGITS: usize = 15;
const EMAIL_MAX: usize = 254;

/// Raw submission as received from a client.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SubmissionInput {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, rename = "type")]
    pub application_type: String,
    #[serde(default)]
    pub fee_amount: Option<f64>,
}

/// A submission that passed validation.
#[derive(Clone, Debug, PartialEq)]
pub struct NewApplication {
    pub applicant: NewApplicant,
    pub application_type: ApplicationType,
    pub fee_amount: f64,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{}", .errors.join("; "))]
pub struct ValidationErrors {
    pub errors: Vec<String>,
}

impl SubmissionInput {
    pub fn validate(&self) -> Result<NewApplication, ValidationErrors> {
        let mut errors = Vec::new();

        let full_name = self.full_name.trim();
        if let Err(e) = validate_name(full_name) {
            errors.push(e);
        }

        let phone = normalize_phone(&self.phone);
        if let Err(e) = validate_phone(&phone) {
            errors.push(e);
        }

        let email = self.email.trim().to_lowercase();
        if !is_valid_email(&email) {
            errors.push("email: invalid email address".to_string());
        }

        let application_type = match self.application_type.trim().parse::<ApplicationType>() {
            Ok(ty) => Some(ty),
            Err(_) => {
                errors.push("type: must be one of business, building, barangay".to_string());
                None
            }
        };

        let fee_amount = self.fee_amount.unwrap_or(0.0);
        if !fee_amount.is_finite() || fee_amount < 0.0 {
            errors.push("fee_amount: must be a non-negative number".to_string());
        }

        match application_type {
            Some(application_type) if errors.is_empty() => Ok(NewApplication {
                applicant: NewApplicant {
                    full_name: full_name.to_string(),
                    phone,
                    email,
                },
                application_type,
                fee_amount,
            }),
            _ => Err(ValidationErrors { errors }),
        }
    }
}

fn validate_name(name: &str) -> Result<(), String> {
    let len = name.chars().count();
    if len < NAME_MIN {
        return Err(format!("full_name: must be at least {NAME_MIN} characters"));
    }
    if len > NAME_MAX {
        return Err(format!("full_name: must be at most {NAME_MAX} characters"));
    }
    let allowed = |c: char| c.is_alphabetic() || c == ' ' || c == '.' || c == '-' || c == '\'';
    if !name.chars().all(allowed) {
        return Err("full_name: may only contain letters, spaces, periods, hyphens and apostrophes".to_string());
    }
    Ok(())
}

/// Strip spaces, dashes and parentheses; keep a leading `+`.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect()
}

fn validate_phone(phone: &str) -> Result<(), String> {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err("phone: must contain only digits".to_string());
    }
    if digits.len() < PHONE_MIN_DIGITS {
        return Err(format!("phone: must have at least {PHONE_MIN_DIGITS} digits"));
    }
    if digits.len() > PHONE_MAX_DIGITS {
        return Err(format!("phone: must have at most {PHONE_MAX_DIGITS} digits"));
    }
    Ok(())
}

pub fn is_valid_email(email: &str) -> bool {
    if email.is_empty() || email.len() > EMAIL_MAX || email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jane() -> SubmissionInput {
        SubmissionInput {
            full_name: "Jane Doe".to_string(),
            phone: "09171234567".to_string(),
            email: "Jane@Example.com".to_string(),
            application_type: "business".to_string(),
            fee_amount: None,
        }
    }

    #[test]
    fn valid_submission_is_normalized() {
        let ok = jane().validate().expect("valid");
        assert_eq!(ok.applicant.email, "jane@example.com");
        assert_eq!(ok.application_type, ApplicationType::Business);
        assert_eq!(ok.fee_amount, 0.0);
    }

    #[test]
    fn phone_formatting_is_stripped() {
        let mut input = jane();
        input.phone = "+63 917-123-4567".to_string();
        let ok = input.validate().expect("valid");
        assert_eq!(ok.applicant.phone, "+639171234567");
    }

    #[test]
    fn every_bad_field_is_reported() {
        let input = SubmissionInput {
            full_name: "J".to_string(),
            phone: "12345".to_string(),
            email: "not-an-email".to_string(),
            application_type: "fishing".to_string(),
            fee_amount: Some(-1.0),
        };
        let err = input.validate().expect_err("invalid");
        assert_eq!(err.errors.len(), 5, "{err}");
        assert!(err.to_string().contains("full_name"));
        assert!(err.to_string().contains("type"));
    }

    #[test]
    fn names_reject_markup() {
        let mut input = jane();
        input.full_name = "<script>".to_string();
        assert!(input.validate().is_err());
    }

    #[test]
    fn email_shapes() {
        assert!(is_valid_email("a@b.co"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("@b.co"));
        assert!(!is_valid_email("a b@c.co"));
        assert!(!is_valid_email("a@b@c.co"));
    }
}
