//! Expression evaluation for message personalisation
//!
//! Broadcast bodies may embed small expressions like `@contact.name` that
//! are evaluated against a contact-scoped environment. Evaluation is
//! all-or-nothing per field: any unresolvable expression fails the field so
//! the caller can fall back to the raw template.

use std::collections::HashMap;

use regex::Regex;
use switchyard_storage::models::Contact;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum EvalError {
    #[error("unknown expression: @{0}")]
    Unknown(String),
}

/// A contact-scoped evaluation environment
pub struct ExprEnv {
    values: HashMap<String, String>,
}

impl ExprEnv {
    /// Build the environment for a contact and their destination URN
    pub fn for_contact(contact: &Contact, urn: Option<&str>) -> Self {
        let mut values = HashMap::new();

        let display = contact.name.clone().unwrap_or_default();
        values.insert("contact".to_string(), display.clone());
        values.insert("contact.name".to_string(), display);
        values.insert("contact.uuid".to_string(), contact.uuid.to_string());
        values.insert(
            "contact.language".to_string(),
            contact.language.clone().unwrap_or_default(),
        );
        values.insert(
            "contact.urn".to_string(),
            urn.unwrap_or_default().to_string(),
        );

        Self { values }
    }

    fn lookup(&self, path: &str) -> Option<&str> {
        self.values.get(path).map(|v| v.as_str())
    }
}

fn expression_pattern() -> Regex {
    // any `@word` optionally followed by dotted segments; trailing dots are
    // punctuation, not path separators
    Regex::new(r"@([a-zA-Z][a-zA-Z0-9_]*(?:\.[a-zA-Z][a-zA-Z0-9_]*)*)").expect("valid regex")
}

/// Evaluate a template against the environment, substituting every
/// expression. Unknown expressions fail the whole field.
pub fn evaluate_template(template: &str, env: &ExprEnv) -> Result<String, EvalError> {
    let re = expression_pattern();

    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in re.captures_iter(template) {
        let whole = caps.get(0).expect("match always has group 0");
        let path = &caps[1];

        let value = env
            .lookup(path)
            .ok_or_else(|| EvalError::Unknown(path.to_string()))?;

        out.push_str(&template[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }

    out.push_str(&template[last..]);
    Ok(out)
}

/// Evaluate each template in a list, keeping raw values for the ones that
/// fail. Returns the values plus the number of failures.
pub fn evaluate_all(templates: &[String], env: &ExprEnv) -> (Vec<String>, usize) {
    let mut failures = 0;
    let values = templates
        .iter()
        .map(|t| match evaluate_template(t, env) {
            Ok(v) => v,
            Err(_) => {
                failures += 1;
                t.clone()
            }
        })
        .collect();
    (values, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn felix() -> Contact {
        Contact {
            id: 1,
            uuid: Uuid::new_v4(),
            org_id: 1,
            name: Some("Felix".to_string()),
            language: Some("fra".to_string()),
            status: "A".to_string(),
            created_on: Utc::now(),
            modified_on: Utc::now(),
            last_seen_on: None,
        }
    }

    #[test]
    fn test_evaluate_name() {
        let contact = felix();
        let env = ExprEnv::for_contact(&contact, None);

        assert_eq!(
            evaluate_template("Hello @contact.name", &env).unwrap(),
            "Hello Felix"
        );
        assert_eq!(evaluate_template("Hi @contact", &env).unwrap(), "Hi Felix");
        assert_eq!(
            evaluate_template("no expressions here", &env).unwrap(),
            "no expressions here"
        );
    }

    #[test]
    fn test_evaluate_multiple() {
        let contact = felix();
        let env = ExprEnv::for_contact(&contact, Some("tel:+593979012345"));

        assert_eq!(
            evaluate_template("@contact.name is @contact.language at @contact.urn", &env).unwrap(),
            "Felix is fra at tel:+593979012345"
        );
    }

    #[test]
    fn test_unknown_expression_fails() {
        let contact = felix();
        let env = ExprEnv::for_contact(&contact, None);

        assert_eq!(
            evaluate_template("Hi @contact.age", &env),
            Err(EvalError::Unknown("contact.age".to_string()))
        );
        assert_eq!(
            evaluate_template("Hi @fields.foo", &env),
            Err(EvalError::Unknown("fields.foo".to_string()))
        );
    }

    #[test]
    fn test_evaluate_all_keeps_raw_on_failure() {
        let contact = felix();
        let env = ExprEnv::for_contact(&contact, None);

        let (values, failures) = evaluate_all(
            &["@contact.name".to_string(), "@contact.age".to_string()],
            &env,
        );
        assert_eq!(values, vec!["Felix".to_string(), "@contact.age".to_string()]);
        assert_eq!(failures, 1);
    }
}
