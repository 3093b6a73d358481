use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;

use crate::errors::SessionError;

const MAX_PROJECT_NAME_CHARS: usize = 200;

/// Case-study template the backend should follow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateType {
    #[default]
    Comprehensive,
    Technical,
    Marketing,
    Product,
    Custom,
}

impl TemplateType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Comprehensive => "comprehensive",
            Self::Technical => "technical",
            Self::Marketing => "marketing",
            Self::Product => "product",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for TemplateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateType {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "comprehensive" => Ok(Self::Comprehensive),
            "technical" => Ok(Self::Technical),
            "marketing" => Ok(Self::Marketing),
            "product" => Ok(Self::Product),
            "custom" => Ok(Self::Custom),
            other => Err(SessionError::Validation(format!(
                "unknown template type: {other}"
            ))),
        }
    }
}

/// Project scope and generation options sent to the backend.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GenerationRequest {
    pub project_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_industry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_focus: Option<String>,
    pub date_range_start: NaiveDate,
    pub date_range_end: NaiveDate,
    pub participants: Vec<String>,
    pub keywords: Vec<String>,
    pub template_type: TemplateType,
    pub model_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,
}

impl GenerationRequest {
    /// Starts a request for `project_name` over the inclusive date range.
    pub fn new(project_name: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            project_name: project_name.into(),
            project_industry: None,
            project_focus: None,
            date_range_start: start,
            date_range_end: end,
            participants: Vec::new(),
            keywords: Vec::new(),
            template_type: TemplateType::default(),
            model_name: "gpt-4".to_string(),
            custom_instructions: None,
        }
    }

    pub fn participant(mut self, email: impl Into<String>) -> Self {
        self.participants.push(email.into());
        self
    }

    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keywords.push(keyword.into());
        self
    }

    pub fn template(mut self, template: TemplateType) -> Self {
        self.template_type = template;
        self
    }

    pub fn model(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn industry(mut self, industry: impl Into<String>) -> Self {
        self.project_industry = Some(industry.into());
        self
    }

    pub fn focus(mut self, focus: impl Into<String>) -> Self {
        self.project_focus = Some(focus.into());
        self
    }

    pub fn custom_instructions(mut self, text: impl Into<String>) -> Self {
        self.custom_instructions = Some(text.into());
        self
    }

    /// Checks the request before any transport is opened.
    pub fn validate(&self) -> Result<(), SessionError> {
        let name = self.project_name.trim();
        if name.is_empty() {
            return Err(SessionError::Validation(
                "project name must not be empty".into(),
            ));
        }
        if name.chars().count() > MAX_PROJECT_NAME_CHARS {
            return Err(SessionError::Validation(format!(
                "project name must be at most {MAX_PROJECT_NAME_CHARS} characters"
            )));
        }
        if self.date_range_start > self.date_range_end {
            return Err(SessionError::Validation(format!(
                "date range start {} is after end {}",
                self.date_range_start, self.date_range_end
            )));
        }
        if self.participants.is_empty() {
            return Err(SessionError::Validation(
                "at least one participant is required".into(),
            ));
        }
        if self.participants.iter().any(|p| p.trim().is_empty()) {
            return Err(SessionError::Validation(
                "participant entries must not be blank".into(),
            ));
        }
        if self.keywords.is_empty() {
            return Err(SessionError::Validation(
                "at least one keyword is required".into(),
            ));
        }
        if self.keywords.iter().any(|k| k.trim().is_empty()) {
            return Err(SessionError::Validation(
                "keyword entries must not be blank".into(),
            ));
        }
        if self.model_name.trim().is_empty() {
            return Err(SessionError::Validation("model name must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().expect("date")
    }

    fn valid() -> GenerationRequest {
        GenerationRequest::new("Apollo", date("2024-01-01"), date("2024-03-31"))
            .participant("a@example.com")
            .keyword("launch")
    }

    #[test]
    fn valid_request_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_date_range() {
        let mut req = valid();
        req.date_range_start = date("2024-04-01");
        assert!(
            matches!(req.validate(), Err(SessionError::Validation(msg)) if msg.contains("after end"))
        );
    }

    #[test]
    fn rejects_missing_scope() {
        let req = GenerationRequest::new("Apollo", date("2024-01-01"), date("2024-01-02"));
        assert!(
            matches!(req.validate(), Err(SessionError::Validation(msg)) if msg.contains("participant"))
        );
        let req = req.participant("a@example.com");
        assert!(
            matches!(req.validate(), Err(SessionError::Validation(msg)) if msg.contains("keyword"))
        );
        let req = valid().keyword("  ");
        assert!(matches!(req.validate(), Err(SessionError::Validation(_))));
    }

    #[test]
    fn rejects_overlong_project_name() {
        let mut req = valid();
        req.project_name = "x".repeat(201);
        assert!(matches!(req.validate(), Err(SessionError::Validation(_))));
    }

    #[test]
    fn serializes_wire_shape() {
        let value = serde_json::to_value(valid().template(TemplateType::Technical))
            .expect("serialize");
        assert_eq!(value["template_type"], "technical");
        assert_eq!(value["date_range_start"], "2024-01-01");
        assert_eq!(value["model_name"], "gpt-4");
        assert!(value.get("custom_instructions").is_none());
    }

    #[test]
    fn template_parses_case_insensitively() {
        assert_eq!("Marketing".parse::<TemplateType>(), Ok(TemplateType::Marketing));
        assert!("poem".parse::<TemplateType>().is_err());
    }
}
