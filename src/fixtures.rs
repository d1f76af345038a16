//! Builders for throwaway test data in sandbox orgs.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::record::{a_user, an_account, an_opportunity, Record};

/// Prefix stamped into every generated name so test data is recognisable.
pub const TEMPLATE_NAME: &str = "opportunity-broadcast";

const MAIL_SERVER: &str = "fakemail";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// `<name><template><millis>`, plus a per-process counter so two names built
/// in the same millisecond still differ.
pub fn unique_name(template: &str, name: &str) -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{name}{template}{}{seq}", Utc::now().timestamp_millis())
}

pub fn unique_email(user: &str) -> String {
    format!("{}@{MAIL_SERVER}.com", unique_name(TEMPLATE_NAME, user))
}

/// An opportunity that is safe to create in a sandbox: far-future close
/// date and a stage no real pipeline uses.
pub fn test_opportunity(sequence: usize) -> Record {
    an_opportunity()
        .with("Name", unique_name(TEMPLATE_NAME, &format!("OppName{sequence}_")))
        .with("StageName", "NoStage")
        .with("CloseDate", "2050-10-10")
        .with("Probability", "1")
        .build()
}

pub fn test_account(sequence: usize) -> Record {
    an_account()
        .with("Name", unique_name(TEMPLATE_NAME, &format!("AccName{sequence}_")))
        .with("Industry", "Education")
        .build()
}

/// A user with a unique email, active or not.
pub fn test_user(first_name: &str, active: bool) -> Record {
    a_user()
        .with("FirstName", first_name)
        .with("LastName", "Sample")
        .with("Email", unique_email(first_name))
        .with("IsActive", active)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ObjectType;

    #[test]
    fn test_unique_names_differ() {
        let a = unique_name(TEMPLATE_NAME, "FN");
        let b = unique_name(TEMPLATE_NAME, "FN");
        assert_ne!(a, b);
        assert!(a.starts_with("FNopportunity-broadcast"));
    }

    #[test]
    fn test_unique_email_shape() {
        let email = unique_email("user");
        assert!(email.starts_with("useropportunity-broadcast"));
        assert!(email.ends_with("@fakemail.com"));
    }

    #[test]
    fn test_fixtures_carry_match_keys() {
        assert!(test_opportunity(0).match_value(ObjectType::Opportunity).is_some());
        assert!(test_account(1).match_value(ObjectType::Account).is_some());
        let user = test_user("Ann", false);
        assert!(user.match_value(ObjectType::User).is_some());
        assert_eq!(user.get("IsActive"), Some(&serde_json::Value::Bool(false)));
    }
}
