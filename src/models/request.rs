//! Request forms and their validated counterparts.
//!
//! Transport layers (HTTP bodies, CLI arguments) produce loosely-typed forms.
//! All string-to-number coercion and range checking happens in the
//! `TryFrom` conversions here, so the engine only ever sees validated values.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Side;
use crate::ledger::EngineError;

/// How the `value` of an open request is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SizeMode {
    /// `value` is a quantity of the instrument
    Quantity,
    /// `value` is a USD notional
    NominalValue,
}

impl SizeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SizeMode::Quantity => "QUANTITY",
            SizeMode::NominalValue => "NOMINAL_VALUE",
        }
    }
}

impl fmt::Display for SizeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SizeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .to_uppercase()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect();
        match normalized.as_str() {
            "QUANTITY" => Ok(SizeMode::Quantity),
            "NOMINALVALUE" => Ok(SizeMode::NominalValue),
            _ => Err(format!(
                "invalid size mode '{}', expected QUANTITY or NOMINAL_VALUE",
                s
            )),
        }
    }
}

/// Raw open-position request as received from a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrderForm {
    pub coin: Option<String>,
    pub side: Option<String>,
    pub size_by: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub leverage: Option<Value>,
}

impl OpenOrderForm {
    /// Build a form from command-line strings.
    pub fn from_args(
        coin: &str,
        side: &str,
        size_by: &str,
        value: &str,
        leverage: Option<&str>,
    ) -> Self {
        Self {
            coin: Some(coin.to_string()),
            side: Some(side.to_string()),
            size_by: Some(size_by.to_string()),
            value: Some(Value::String(value.to_string())),
            leverage: leverage.map(|l| Value::String(l.to_string())),
        }
    }
}

/// Raw close-position request as received from a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseOrderForm {
    pub coin: Option<String>,
    #[serde(default)]
    pub leverage: Option<Value>,
}

impl CloseOrderForm {
    pub fn from_args(coin: &str, leverage: Option<&str>) -> Self {
        Self {
            coin: Some(coin.to_string()),
            leverage: leverage.map(|l| Value::String(l.to_string())),
        }
    }
}

/// Validated open/increase request.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub instrument: String,
    pub side: Side,
    pub size_mode: SizeMode,
    /// Strictly positive
    pub value: Decimal,
    /// Strictly positive when present; BUY requests always carry one >= 1
    pub leverage: Option<Decimal>,
}

/// Validated close request.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseRequest {
    pub instrument: String,
    /// Strictly positive when present
    pub leverage: Option<Decimal>,
}

impl TryFrom<OpenOrderForm> for OpenRequest {
    type Error = EngineError;

    fn try_from(form: OpenOrderForm) -> Result<Self, Self::Error> {
        let instrument = parse_instrument(form.coin.as_deref())?;

        let side = form
            .side
            .as_deref()
            .ok_or_else(|| EngineError::Validation("side is required".to_string()))?
            .parse::<Side>()
            .map_err(EngineError::Validation)?;

        let size_mode = form
            .size_by
            .as_deref()
            .ok_or_else(|| EngineError::Validation("sizeBy is required".to_string()))?
            .parse::<SizeMode>()
            .map_err(EngineError::Validation)?;

        let value = parse_decimal_field("value", form.value.as_ref())?
            .ok_or_else(|| EngineError::Validation("value is required".to_string()))?;
        if value <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "value must be positive, got {}",
                value
            )));
        }

        let leverage = parse_leverage(form.leverage.as_ref())?;
        if side == Side::Buy {
            match leverage {
                Some(l) if l >= Decimal::ONE => {}
                Some(l) => {
                    return Err(EngineError::Validation(format!(
                        "leverage must be at least 1 for BUY, got {}",
                        l
                    )))
                }
                None => {
                    return Err(EngineError::Validation(
                        "leverage is required for BUY".to_string(),
                    ))
                }
            }
        }

        Ok(Self {
            instrument,
            side,
            size_mode,
            value,
            leverage,
        })
    }
}

impl TryFrom<CloseOrderForm> for CloseRequest {
    type Error = EngineError;

    fn try_from(form: CloseOrderForm) -> Result<Self, Self::Error> {
        Ok(Self {
            instrument: parse_instrument(form.coin.as_deref())?,
            leverage: parse_leverage(form.leverage.as_ref())?,
        })
    }
}

/// Normalize an instrument id: trimmed and upper-cased.
pub fn normalize_instrument(raw: &str) -> String {
    raw.trim().to_uppercase()
}

fn parse_instrument(raw: Option<&str>) -> Result<String, EngineError> {
    let instrument = raw.map(normalize_instrument).unwrap_or_default();
    if instrument.is_empty() {
        return Err(EngineError::Validation("coin is required".to_string()));
    }
    Ok(instrument)
}

fn parse_leverage(raw: Option<&Value>) -> Result<Option<Decimal>, EngineError> {
    let leverage = parse_decimal_field("leverage", raw)?;
    if let Some(l) = leverage {
        if l <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "leverage must be positive, got {}",
                l
            )));
        }
    }
    Ok(leverage)
}

/// Coerce a JSON number or numeric string into a decimal.
///
/// `null` and a missing field both yield `Ok(None)`.
fn parse_decimal_field(field: &str, raw: Option<&Value>) -> Result<Option<Decimal>, EngineError> {
    let text = match raw {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => {
            return Err(EngineError::Validation(format!(
                "{} must be a number, got {}",
                field, other
            )))
        }
    };

    parse_decimal(&text)
        .map(Some)
        .ok_or_else(|| EngineError::Validation(format!("{} is not numeric: '{}'", field, text)))
}

/// Parse plain or scientific notation into a decimal.
pub fn parse_decimal(text: &str) -> Option<Decimal> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn form(body: Value) -> OpenOrderForm {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_open_request_accepts_numbers_and_strings() {
        let req = OpenRequest::try_from(form(json!({
            "coin": "btc-usdt-swap",
            "side": "buy",
            "sizeBy": "NOMINALVALUE",
            "value": "1500.5",
            "leverage": 10
        })))
        .unwrap();

        assert_eq!(req.instrument, "BTC-USDT-SWAP");
        assert_eq!(req.side, Side::Buy);
        assert_eq!(req.size_mode, SizeMode::NominalValue);
        assert_eq!(req.value, dec!(1500.5));
        assert_eq!(req.leverage, Some(dec!(10)));
    }

    #[test]
    fn test_open_request_rejects_bad_fields() {
        let cases = vec![
            json!({"side": "BUY", "sizeBy": "QUANTITY", "value": 1, "leverage": 1}),
            json!({"coin": "BTC", "side": "HOLD", "sizeBy": "QUANTITY", "value": 1, "leverage": 1}),
            json!({"coin": "BTC", "side": "BUY", "sizeBy": "LOTS", "value": 1, "leverage": 1}),
            json!({"coin": "BTC", "side": "BUY", "sizeBy": "QUANTITY", "value": 0, "leverage": 1}),
            json!({"coin": "BTC", "side": "BUY", "sizeBy": "QUANTITY", "value": "abc", "leverage": 1}),
            json!({"coin": "BTC", "side": "BUY", "sizeBy": "QUANTITY", "value": 1}),
            json!({"coin": "BTC", "side": "BUY", "sizeBy": "QUANTITY", "value": 1, "leverage": 0.5}),
            json!({"coin": "BTC", "side": "SELL", "sizeBy": "QUANTITY", "value": 1, "leverage": -2}),
            json!({"coin": "BTC", "side": "SELL", "sizeBy": "QUANTITY", "value": [1]}),
        ];

        for body in cases {
            let result = OpenRequest::try_from(form(body.clone()));
            assert!(
                matches!(result, Err(EngineError::Validation(_))),
                "expected validation error for {}",
                body
            );
        }
    }

    #[test]
    fn test_sell_without_leverage_is_allowed() {
        let req = OpenRequest::try_from(form(json!({
            "coin": "ETH-USDT-SWAP",
            "side": "SELL",
            "sizeBy": "QUANTITY",
            "value": 2
        })))
        .unwrap();
        assert_eq!(req.leverage, None);
    }

    #[test]
    fn test_close_request_validation() {
        let form = CloseOrderForm::from_args(" eth-usdt-swap ", None);
        let ok = CloseRequest::try_from(form).unwrap();
        assert_eq!(ok.instrument, "ETH-USDT-SWAP");
        assert_eq!(ok.leverage, None);

        assert!(CloseRequest::try_from(CloseOrderForm::from_args("ETH", Some("0"))).is_err());
        assert!(CloseRequest::try_from(CloseOrderForm::from_args("ETH", Some("x"))).is_err());
        assert!(CloseRequest::try_from(CloseOrderForm::from_args("", Some("2"))).is_err());
    }

    #[test]
    fn test_parse_decimal_scientific() {
        assert_eq!(parse_decimal("1e-7"), Some(dec!(0.0000001)));
        assert_eq!(parse_decimal("60000.5"), Some(dec!(60000.5)));
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("NaN"), None);
    }
}
