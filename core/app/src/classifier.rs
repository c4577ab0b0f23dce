//! Symptom classification seam.

use async_trait::async_trait;

use sehatlink_common::{AnalysisResult, Error, Result, Severity};

/// Turns a free-text symptom description into an analysis.
///
/// `offline` tells the classifier it must work from local data only.
#[async_trait]
pub trait SymptomClassifier: Send + Sync {
    async fn classify(&self, symptoms: &str, offline: bool) -> Result<AnalysisResult>;
}

/// Rule-based classifier that works without a network.
///
/// Matches a few red-flag keywords. Offline results carry reduced
/// confidence (never below 50) and say so in their description.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    fn analyze(symptoms: &str) -> AnalysisResult {
        let text = symptoms.to_lowercase();

        if text.contains("severe") || text.contains("critical") {
            return AnalysisResult {
                condition: "Serious Condition".to_string(),
                description:
                    "Your symptoms indicate a serious condition requiring immediate medical attention."
                        .to_string(),
                confidence: 90,
                severity: Severity::Critical,
                recommendations: vec![
                    "Seek immediate medical attention".to_string(),
                    "Call emergency services (108)".to_string(),
                    "Do not delay treatment".to_string(),
                    "Have someone accompany you".to_string(),
                ],
                similar_cases: 234,
                seek_medical_help: true,
            };
        }

        if text.contains("chest pain") || text.contains("breathing") {
            return AnalysisResult {
                condition: "Respiratory Infection".to_string(),
                description:
                    "Your symptoms suggest a respiratory infection that requires medical attention."
                        .to_string(),
                confidence: 85,
                severity: Severity::Medium,
                recommendations: vec![
                    "Seek medical attention within 24 hours".to_string(),
                    "Monitor breathing difficulty".to_string(),
                    "Take prescribed medications".to_string(),
                    "Rest and avoid physical exertion".to_string(),
                ],
                similar_cases: 892,
                seek_medical_help: true,
            };
        }

        AnalysisResult {
            condition: "Common Cold".to_string(),
            description: "Based on your symptoms, you likely have a common cold. This is a viral infection that usually resolves on its own.".to_string(),
            confidence: 75,
            severity: Severity::Low,
            recommendations: vec![
                "Rest and drink plenty of fluids".to_string(),
                "Take paracetamol for fever and pain".to_string(),
                "Use warm salt water gargle for sore throat".to_string(),
                "Monitor symptoms for 3-5 days".to_string(),
            ],
            similar_cases: 1247,
            seek_medical_help: false,
        }
    }
}

#[async_trait]
impl SymptomClassifier for KeywordClassifier {
    async fn classify(&self, symptoms: &str, offline: bool) -> Result<AnalysisResult> {
        if symptoms.trim().is_empty() {
            return Err(Error::InvalidInput("No symptoms described".to_string()));
        }

        let mut result = Self::analyze(symptoms);
        if offline {
            result.confidence = result.confidence.saturating_sub(20).max(50);
            result
                .description
                .push_str(" (Analysis performed offline with limited data)");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_red_flags() {
        let classifier = KeywordClassifier;

        let result = classifier.classify("Severe headache", false).await.unwrap();
        assert_eq!(result.severity, Severity::Critical);
        assert!(result.seek_medical_help);

        let result = classifier.classify("chest pain at night", false).await.unwrap();
        assert_eq!(result.condition, "Respiratory Infection");

        let result = classifier.classify("runny nose", false).await.unwrap();
        assert_eq!(result.severity, Severity::Low);
        assert_eq!(result.confidence, 75);
    }

    #[tokio::test]
    async fn test_offline_lowers_confidence() {
        let result = KeywordClassifier.classify("runny nose", true).await.unwrap();
        assert_eq!(result.confidence, 55);
        assert!(result.description.ends_with("(Analysis performed offline with limited data)"));
    }

    #[tokio::test]
    async fn test_blank_input_rejected() {
        assert!(matches!(
            KeywordClassifier.classify("   ", false).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
