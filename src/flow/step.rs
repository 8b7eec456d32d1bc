//! Order-intake steps and the state-transition table.
//!
//! The step graph is linear with two irregularities: skip edges over the
//! optional fields (unit/apartment line, phone) and a jump-to-confirmation
//! edge taken when every required field is already collected (re-entry after
//! an edit or an expired-and-restored flow). Transitions are a pure function
//! of (step, event, collected data) so the graph is testable without any
//! transport or storage.

use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FlowError;

/// Button payload for skipping an optional field.
pub const SKIP: &str = "skip";
/// Button payload confirming the order summary.
pub const CONFIRM: &str = "confirm";
/// Button payload prefix for selecting a rate quote.
pub const RATE_PREFIX: &str = "rate:";
/// Reserved temp_data key holding the step to resume after a declined cancel.
pub const RESUME_STEP_KEY: &str = "resume_step";
/// Reserved temp_data key holding fetched rate quotes.
pub const RATE_QUOTES_KEY: &str = "rate_quotes";

/// Steps of the order-intake conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStep {
    Start,
    FromName,
    FromZip,
    FromStreet,
    FromUnit,
    FromPhone,
    ToName,
    ToZip,
    ToStreet,
    ToUnit,
    ToPhone,
    ParcelWeight,
    ParcelSize,
    RateSelect,
    Confirm,
    AwaitPayment,
    ConfirmCancel,
}

impl OrderStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::FromName => "from_name",
            Self::FromZip => "from_zip",
            Self::FromStreet => "from_street",
            Self::FromUnit => "from_unit",
            Self::FromPhone => "from_phone",
            Self::ToName => "to_name",
            Self::ToZip => "to_zip",
            Self::ToStreet => "to_street",
            Self::ToUnit => "to_unit",
            Self::ToPhone => "to_phone",
            Self::ParcelWeight => "parcel_weight",
            Self::ParcelSize => "parcel_size",
            Self::RateSelect => "rate_select",
            Self::Confirm => "confirm",
            Self::AwaitPayment => "await_payment",
            Self::ConfirmCancel => "confirm_cancel",
        }
    }

    pub fn parse(value: &str) -> Result<Self, FlowError> {
        match value {
            "start" => Ok(Self::Start),
            "from_name" => Ok(Self::FromName),
            "from_zip" => Ok(Self::FromZip),
            "from_street" => Ok(Self::FromStreet),
            "from_unit" => Ok(Self::FromUnit),
            "from_phone" => Ok(Self::FromPhone),
            "to_name" => Ok(Self::ToName),
            "to_zip" => Ok(Self::ToZip),
            "to_street" => Ok(Self::ToStreet),
            "to_unit" => Ok(Self::ToUnit),
            "to_phone" => Ok(Self::ToPhone),
            "parcel_weight" => Ok(Self::ParcelWeight),
            "parcel_size" => Ok(Self::ParcelSize),
            "rate_select" => Ok(Self::RateSelect),
            "confirm" => Ok(Self::Confirm),
            "await_payment" => Ok(Self::AwaitPayment),
            "confirm_cancel" => Ok(Self::ConfirmCancel),
            other => Err(FlowError::UnknownStep(other.to_string())),
        }
    }

    /// Static predecessor table for "go back" on external failure.
    ///
    /// Deliberately a fixed enum-to-enum mapping, not the history list:
    /// revert behavior stays deterministic and auditable no matter what path
    /// the user took to reach the step.
    pub fn predecessor(self) -> Option<OrderStep> {
        match self {
            Self::Start => None,
            Self::FromName => Some(Self::Start),
            Self::FromZip => Some(Self::FromName),
            Self::FromStreet => Some(Self::FromZip),
            Self::FromUnit => Some(Self::FromStreet),
            Self::FromPhone => Some(Self::FromUnit),
            Self::ToName => Some(Self::FromPhone),
            Self::ToZip => Some(Self::ToName),
            Self::ToStreet => Some(Self::ToZip),
            Self::ToUnit => Some(Self::ToStreet),
            Self::ToPhone => Some(Self::ToUnit),
            Self::ParcelWeight => Some(Self::ToPhone),
            Self::ParcelSize => Some(Self::ParcelWeight),
            Self::RateSelect => Some(Self::ParcelSize),
            Self::Confirm => Some(Self::RateSelect),
            Self::AwaitPayment => Some(Self::Confirm),
            // Cancellation resumes via RESUME_STEP_KEY, never via revert.
            Self::ConfirmCancel => None,
        }
    }

    /// Linear successor, before the jump-to-confirm guard is applied.
    fn successor(self) -> OrderStep {
        match self {
            Self::Start => Self::FromName,
            Self::FromName => Self::FromZip,
            Self::FromZip => Self::FromStreet,
            Self::FromStreet => Self::FromUnit,
            Self::FromUnit => Self::FromPhone,
            Self::FromPhone => Self::ToName,
            Self::ToName => Self::ToZip,
            Self::ToZip => Self::ToStreet,
            Self::ToStreet => Self::ToUnit,
            Self::ToUnit => Self::ToPhone,
            Self::ToPhone => Self::ParcelWeight,
            Self::ParcelWeight => Self::ParcelSize,
            Self::ParcelSize => Self::RateSelect,
            Self::RateSelect => Self::Confirm,
            Self::Confirm => Self::AwaitPayment,
            Self::AwaitPayment => Self::AwaitPayment,
            Self::ConfirmCancel => Self::ConfirmCancel,
        }
    }

    /// The prompt shown when the conversation arrives at this step.
    pub fn prompt(self) -> &'static str {
        match self {
            Self::Start => "Welcome to parcelflow. Send anything to start a new shipment, or /cancel at any point.",
            Self::FromName => "Sender: what's the full name?",
            Self::FromZip => "Sender ZIP code?",
            Self::FromStreet => "Sender street address?",
            Self::FromUnit => "Sender apartment/unit? (optional)",
            Self::FromPhone => "Sender phone number? (optional)",
            Self::ToName => "Recipient: what's the full name?",
            Self::ToZip => "Recipient ZIP code?",
            Self::ToStreet => "Recipient street address?",
            Self::ToUnit => "Recipient apartment/unit? (optional)",
            Self::ToPhone => "Recipient phone number? (optional)",
            Self::ParcelWeight => "Parcel weight in kg (e.g. 2.5)?",
            Self::ParcelSize => "Parcel size in cm as LxWxH (e.g. 30x20x10)?",
            Self::RateSelect => "Pick a shipping rate:",
            Self::Confirm => "Review your order above. Confirm?",
            Self::AwaitPayment => "Waiting for your payment. I'll message you the moment it lands.",
            Self::ConfirmCancel => "Cancel this order? All entered data will be lost.",
        }
    }

    /// Inline buttons offered at this step, as payload strings.
    pub fn buttons(self) -> &'static [&'static str] {
        match self {
            Self::FromUnit | Self::FromPhone | Self::ToUnit | Self::ToPhone => &[SKIP],
            Self::Confirm => &[CONFIRM, "cancel"],
            Self::ConfirmCancel => &["yes", "no"],
            _ => &[],
        }
    }

    /// Which temp_data key this step collects into, if any.
    pub fn collect_key(self) -> Option<&'static str> {
        match self {
            Self::FromName => Some("from_name"),
            Self::FromZip => Some("from_zip"),
            Self::FromStreet => Some("from_street"),
            Self::FromUnit => Some("from_unit"),
            Self::FromPhone => Some("from_phone"),
            Self::ToName => Some("to_name"),
            Self::ToZip => Some("to_zip"),
            Self::ToStreet => Some("to_street"),
            Self::ToUnit => Some("to_unit"),
            Self::ToPhone => Some("to_phone"),
            Self::ParcelWeight => Some("weight_kg"),
            Self::ParcelSize => Some("dimensions_cm"),
            Self::RateSelect => Some("selected_rate"),
            _ => None,
        }
    }
}

/// Fields that must be present before the order can be confirmed.
const REQUIRED_FIELDS: &[&str] = &[
    "from_name",
    "from_zip",
    "from_street",
    "to_name",
    "to_zip",
    "to_street",
    "weight_kg",
    "dimensions_cm",
    "selected_rate",
];

/// True once every required field has been collected.
pub fn required_complete(temp_data: &Map<String, Value>) -> bool {
    REQUIRED_FIELDS.iter().all(|key| temp_data.contains_key(*key))
}

/// Next step after a successful collection at `step`, given the temp_data
/// state that includes the just-collected value. Applies the
/// jump-to-confirmation guard.
pub fn next_step(step: OrderStep, temp_data: &Map<String, Value>) -> OrderStep {
    let linear = step.successor();
    // Jump edge: everything needed is on file, skip the remaining walk.
    // Never jump past rate selection or out of the payment tail.
    if required_complete(temp_data)
        && !matches!(linear, OrderStep::AwaitPayment | OrderStep::ConfirmCancel)
    {
        return OrderStep::Confirm;
    }
    linear
}

/// A validated outcome of applying one user event to a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Store `value` under the step's collect key and advance.
    Collect { key: &'static str, value: Value },
    /// Optional field skipped; advance with nothing stored.
    Skipped,
}

static ZIP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{5}(-\d{4})?$").unwrap());
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9][0-9 ().-]{6,18}$").unwrap());
static DIMENSIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,3})\s*[xX]\s*(\d{1,3})\s*[xX]\s*(\d{1,3})$").unwrap());

fn invalid(step: OrderStep, message: impl Into<String>) -> FlowError {
    FlowError::Validation {
        step: step.as_str().to_string(),
        message: message.into(),
    }
}

fn validate_name(step: OrderStep, input: &str) -> Result<StepOutcome, FlowError> {
    let trimmed = input.trim();
    if trimmed.len() < 2 || trimmed.len() > 64 {
        return Err(invalid(step, "name must be 2-64 characters"));
    }
    collect(step, Value::String(trimmed.to_string()))
}

fn validate_zip(step: OrderStep, input: &str) -> Result<StepOutcome, FlowError> {
    let trimmed = input.trim();
    if !ZIP_RE.is_match(trimmed) {
        return Err(invalid(step, "expected a ZIP like 94107 or 94107-1234"));
    }
    collect(step, Value::String(trimmed.to_string()))
}

fn validate_street(step: OrderStep, input: &str) -> Result<StepOutcome, FlowError> {
    let trimmed = input.trim();
    if trimmed.len() < 5 || trimmed.len() > 128 {
        return Err(invalid(step, "street address must be 5-128 characters"));
    }
    collect(step, Value::String(trimmed.to_string()))
}

fn validate_optional(step: OrderStep, input: &str) -> Result<StepOutcome, FlowError> {
    let trimmed = input.trim();
    if trimmed.eq_ignore_ascii_case(SKIP) {
        return Ok(StepOutcome::Skipped);
    }
    if trimmed.is_empty() || trimmed.len() > 64 {
        return Err(invalid(step, "value must be 1-64 characters, or skip"));
    }
    collect(step, Value::String(trimmed.to_string()))
}

fn validate_phone(step: OrderStep, input: &str) -> Result<StepOutcome, FlowError> {
    if input.trim().eq_ignore_ascii_case(SKIP) {
        return Ok(StepOutcome::Skipped);
    }
    let trimmed = input.trim();
    if !PHONE_RE.is_match(trimmed) {
        return Err(invalid(step, "expected a phone number like +1 415 555 0100, or skip"));
    }
    collect(step, Value::String(trimmed.to_string()))
}

fn validate_weight(step: OrderStep, input: &str) -> Result<StepOutcome, FlowError> {
    let parsed: Decimal = input
        .trim()
        .parse()
        .map_err(|_| invalid(step, "expected a number of kilograms, e.g. 2.5"))?;
    if parsed <= Decimal::ZERO || parsed > Decimal::from(70) {
        return Err(invalid(step, "weight must be between 0 and 70 kg"));
    }
    collect(step, Value::String(parsed.normalize().to_string()))
}

fn validate_dimensions(step: OrderStep, input: &str) -> Result<StepOutcome, FlowError> {
    let caps = DIMENSIONS_RE
        .captures(input.trim())
        .ok_or_else(|| invalid(step, "expected LxWxH in cm, e.g. 30x20x10"))?;
    let mut sides = [0u32; 3];
    for (i, side) in sides.iter_mut().enumerate() {
        // Capture groups are \d{1,3}; parse cannot fail.
        *side = caps[i + 1].parse().unwrap_or(0);
        if *side == 0 || *side > 200 {
            return Err(invalid(step, "each side must be between 1 and 200 cm"));
        }
    }
    collect(
        step,
        Value::String(format!("{}x{}x{}", sides[0], sides[1], sides[2])),
    )
}

fn validate_rate_choice(
    step: OrderStep,
    input: &str,
    temp_data: &Map<String, Value>,
) -> Result<StepOutcome, FlowError> {
    let rate_id = input
        .strip_prefix(RATE_PREFIX)
        .ok_or_else(|| invalid(step, "pick one of the offered rates"))?;
    let quotes = temp_data
        .get(RATE_QUOTES_KEY)
        .and_then(Value::as_array)
        .ok_or_else(|| invalid(step, "no rates on file yet; tap retry"))?;
    let chosen = quotes
        .iter()
        .find(|quote| quote.get("id").and_then(Value::as_str) == Some(rate_id))
        .ok_or_else(|| invalid(step, "that rate is no longer offered; pick again"))?;
    collect(step, chosen.clone())
}

fn collect(step: OrderStep, value: Value) -> Result<StepOutcome, FlowError> {
    let key = step.collect_key().ok_or_else(|| FlowError::UnexpectedEvent {
        step: step.as_str().to_string(),
        event: "collect".to_string(),
    })?;
    Ok(StepOutcome::Collect { key, value })
}

/// Validate one user event against `step`'s rules.
///
/// `Err(Validation)` is the re-prompt path: no state advances. Steps outside
/// this table (Start, Confirm, AwaitPayment, ConfirmCancel) are driven
/// directly by the engine.
pub fn validate(
    step: OrderStep,
    payload: &str,
    temp_data: &Map<String, Value>,
) -> Result<StepOutcome, FlowError> {
    match step {
        OrderStep::FromName | OrderStep::ToName => validate_name(step, payload),
        OrderStep::FromZip | OrderStep::ToZip => validate_zip(step, payload),
        OrderStep::FromStreet | OrderStep::ToStreet => validate_street(step, payload),
        OrderStep::FromUnit | OrderStep::ToUnit => validate_optional(step, payload),
        OrderStep::FromPhone | OrderStep::ToPhone => validate_phone(step, payload),
        OrderStep::ParcelWeight => validate_weight(step, payload),
        OrderStep::ParcelSize => validate_dimensions(step, payload),
        OrderStep::RateSelect => validate_rate_choice(step, payload, temp_data),
        OrderStep::Start
        | OrderStep::Confirm
        | OrderStep::AwaitPayment
        | OrderStep::ConfirmCancel => Err(FlowError::UnexpectedEvent {
            step: step.as_str().to_string(),
            event: payload.to_string(),
        }),
    }
}
