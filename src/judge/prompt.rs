use serde_json::Value;
use sysrev_common::{Decision, Phase, Usage};

use super::{JudgeRequest, JudgeRole, Judgment};
use crate::errors::JudgeError;

/// Build the prompt for one judgment call.
pub fn build_judge_prompt(request: &JudgeRequest) -> String {
    let doc = &request.item.payload;
    let abstract_text = doc.abstract_text.as_deref().unwrap_or("(no abstract)");
    let authors = if doc.authors.is_empty() {
        "(unknown)".to_string()
    } else {
        doc.authors.join(", ")
    };
    let year = doc.year.map(|y| y.to_string()).unwrap_or_else(|| "n/a".to_string());

    let task = match request.stage {
        Phase::Extraction => {
            "Confirm the study is eligible for data extraction and summarize the extractable \
             data (design, population, intervention, comparator, outcomes, effect sizes) in the \
             rationale."
        }
        _ => "Decide whether the document meets the inclusion criteria.",
    };

    let role_section = match request.role {
        JudgeRole::JudgeA | JudgeRole::JudgeB => {
            "You are one of two independent reviewers. Judge the document on its own merits."
                .to_string()
        }
        JudgeRole::Adjudicator => {
            let opinions = request
                .prior
                .iter()
                .map(|p| {
                    let decision = p
                        .decision
                        .map(|d| d.as_str().to_uppercase())
                        .unwrap_or_else(|| "NONE".to_string());
                    format!(
                        "- {}: {} (confidence {:.2}) - {}",
                        p.actor, decision, p.confidence, p.rationale
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!(
                "You are the adjudicator. The reviewers below disagreed or were not confident \
                 enough. Your decision is binding.\n\n## Prior Opinions\n{}",
                opinions
            )
        }
    };

    format!(
        r#"# Systematic Review: {stage}

Topic: {topic}

{role_section}

## Criteria
{criteria}

## Document
- ID: {id}
- Title: {title}
- Authors: {authors}
- Year: {year}

### Abstract
{abstract_text}

## Task
{task}

## Output

Respond with ONLY a JSON object in this exact format (no markdown, no explanation):

```json
{{
  "decision": "INCLUDE|EXCLUDE|UNCERTAIN",
  "confidence": 0.0-1.0,
  "rationale": "Brief explanation"
}}
```
"#,
        stage = request.stage,
        topic = request.topic,
        role_section = role_section,
        criteria = request.criteria,
        id = request.item.id,
        title = doc.title,
        authors = authors,
        year = year,
        abstract_text = abstract_text,
        task = task,
    )
}

/// Parse the service's stdout into a judgment.
///
/// Accepts either the bare decision object or the CLI's JSON result
/// envelope (`{"type": "result", "result": "...", "usage": {...}}`), in
/// which case the decision is read from the envelope's text and usage from
/// its accounting fields.
pub fn parse_judgment(output: &str) -> Result<Judgment, JudgeError> {
    let mut usage = Usage::default();
    let mut text = output.to_string();

    if let Ok(envelope) = serde_json::from_str::<Value>(output.trim())
        && envelope.get("type").and_then(Value::as_str) == Some("result")
    {
        if envelope.get("is_error").and_then(Value::as_bool) == Some(true) {
            let message = envelope
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or("service reported an error");
            return Err(classify_failure(message));
        }
        usage = envelope_usage(&envelope);
        text = envelope
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
    }

    let json = extract_json(&text)
        .ok_or_else(|| JudgeError::InvalidResponse("no JSON object in response".into()))?;
    let value: Value = serde_json::from_str(&json)
        .map_err(|e| JudgeError::InvalidResponse(format!("malformed JSON: {}", e)))?;

    let decision: Decision = value
        .get("decision")
        .and_then(Value::as_str)
        .ok_or_else(|| JudgeError::InvalidResponse("missing 'decision'".into()))?
        .parse::<Decision>()
        .map_err(|e| JudgeError::InvalidResponse(e.to_string()))?;

    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| JudgeError::InvalidResponse("missing 'confidence'".into()))?
        .clamp(0.0, 1.0);

    let rationale = value
        .get("rationale")
        .or_else(|| value.get("reasoning"))
        .and_then(Value::as_str)
        .unwrap_or("No rationale provided")
        .to_string();

    if let Some(inline) = value.get("usage") {
        usage = merge_usage(usage, inline);
    }

    Ok(Judgment {
        decision,
        confidence,
        rationale,
        usage,
    })
}

fn envelope_usage(envelope: &Value) -> Usage {
    let mut usage = envelope
        .get("usage")
        .map(|u| merge_usage(Usage::default(), u))
        .unwrap_or_default();
    if let Some(cost) = envelope
        .get("total_cost_usd")
        .or_else(|| envelope.get("cost_usd"))
        .and_then(Value::as_f64)
    {
        usage.cost_usd = cost;
    }
    usage
}

fn merge_usage(mut usage: Usage, value: &Value) -> Usage {
    if let Some(n) = value.get("input_tokens").and_then(Value::as_u64) {
        usage.input_tokens = n;
    }
    if let Some(n) = value.get("output_tokens").and_then(Value::as_u64) {
        usage.output_tokens = n;
    }
    if let Some(c) = value.get("cost_usd").and_then(Value::as_f64) {
        usage.cost_usd = c;
    }
    usage
}

/// Map a failure message from the service to the error taxonomy.
///
/// Status codes only count as whole tokens, so "took 4003 ms" stays an
/// invalid response rather than a rejected request.
pub(crate) fn classify_failure(message: &str) -> JudgeError {
    let lower = message.to_lowercase();
    const THROTTLED: [&str; 3] = ["rate limit", "rate_limit", "overloaded"];
    const REJECTED: [&str; 2] = ["invalid_request", "malformed request"];

    let has_status = |code: &str| {
        lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == code)
    };

    if THROTTLED.iter().any(|p| lower.contains(p)) || has_status("429") {
        JudgeError::Throttled(message.trim().to_string())
    } else if REJECTED.iter().any(|p| lower.contains(p)) || has_status("400") {
        JudgeError::Fatal(message.trim().to_string())
    } else {
        JudgeError::InvalidResponse(message.trim().to_string())
    }
}

/// Extract a JSON object from a response that may contain markdown or
/// other text. Fenced ```json blocks win; otherwise the first balanced
/// `{...}` is taken, ignoring braces inside string literals.
pub fn extract_json(response: &str) -> Option<String> {
    if let Some(start) = response.find("```json") {
        let after_marker = &response[start + 7..];
        if let Some(end) = after_marker.find("```") {
            return Some(after_marker[..end].trim().to_string());
        }
    }

    let start = response.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in response[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(response[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
