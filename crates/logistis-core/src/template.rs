use std::collections::BTreeMap;

use thiserror::Error;

use crate::models::Client;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown placeholder: {{{{{0}}}}}")]
    UnknownPlaceholder(String),
    #[error("unclosed placeholder starting at offset {0}")]
    Unclosed(usize),
}

/// Substitute `{{name}}` placeholders. An unknown or unclosed placeholder
/// fails the render; a half-written template must not go out as-is.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0usize;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or(TemplateError::Unclosed(offset + start))?;
        let key = after[..end].trim();
        let value = vars
            .get(key)
            .ok_or_else(|| TemplateError::UnknownPlaceholder(key.to_string()))?;
        out.push_str(value);
        offset += start + 2 + end + 2;
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// The placeholder vocabulary available to client-facing templates.
pub fn client_vars(client: &Client) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert("eponimia".to_string(), client.eponimia.clone());
    vars.insert("afm".to_string(), client.afm.clone());
    vars.insert(
        "email".to_string(),
        client.email.clone().unwrap_or_default(),
    );
    vars.insert(
        "phone".to_string(),
        client.phone.clone().unwrap_or_default(),
    );
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_placeholders() {
        let rendered = render(
            "Dear {{eponimia}} (AFM {{afm}}), your filing is due.",
            &vars(&[("eponimia", "Alpha AE"), ("afm", "123456789")]),
        )
        .unwrap();
        assert_eq!(rendered, "Dear Alpha AE (AFM 123456789), your filing is due.");
    }

    #[test]
    fn placeholder_names_may_carry_whitespace() {
        let rendered = render("{{ afm }}", &vars(&[("afm", "123456789")])).unwrap();
        assert_eq!(rendered, "123456789");
    }

    #[test]
    fn unknown_placeholder_fails_the_render() {
        let err = render("Hello {{who}}", &vars(&[])).unwrap_err();
        assert_eq!(err, TemplateError::UnknownPlaceholder("who".to_string()));
    }

    #[test]
    fn unclosed_placeholder_fails_the_render() {
        let err = render("Hello {{who", &vars(&[])).unwrap_err();
        assert_eq!(err, TemplateError::Unclosed(6));
    }

    #[test]
    fn client_vars_cover_contact_fields() {
        let client = Client {
            id: Uuid::new_v4(),
            afm: "987654321".to_string(),
            eponimia: "Beta OE".to_string(),
            email: Some("beta@example.gr".to_string()),
            phone: None,
            notes: None,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let vars = client_vars(&client);
        assert_eq!(vars["afm"], "987654321");
        assert_eq!(vars["eponimia"], "Beta OE");
        assert_eq!(vars["email"], "beta@example.gr");
        assert_eq!(vars["phone"], "");
    }
}
