//! Oscillation angles
//!
//! The appliance sweeps between a lower (`osal`) and upper (`osau`) angle and
//! refuses anything outside 5°-355°. Callers think in width and heading, so
//! the plan converts between the two and moves the heading when the
//! requested sweep would leave the allowed range.

use super::{field, padded};
use crate::error::CommandError;
use crate::mqtt::message_manager::CommandFields;
use crate::state::DeviceSnapshot;
use serde::Serialize;
use tracing::{debug, warn};

pub const MIN_ANGLE: u32 = 5;
pub const MAX_ANGLE: u32 = 355;
pub const MIN_WIDTH: u32 = 45;
pub const MAX_WIDTH: u32 = 350;
pub const DEFAULT_HEADING: u32 = 180;

/// Width steps offered by the appliance, with their names
pub const WIDTH_STEPS: [(&str, u32); 5] = [
    ("off", 0),
    ("narrow", 45),
    ("medium", 90),
    ("wide", 180),
    ("full", 350),
];

/// Parses a width given as a step name or in degrees
pub fn parse_width(value: &str) -> Result<u32, CommandError> {
    let input = value.trim().to_lowercase();
    if let Some((_, width)) = WIDTH_STEPS.iter().find(|(name, _)| *name == input) {
        return Ok(*width);
    }

    input.parse().map_err(|_| {
        let names: Vec<_> = WIDTH_STEPS.iter().map(|(name, _)| *name).collect();
        CommandError::InvalidWidth(format!(
            "'{}' (use degrees or one of {})",
            value,
            names.join(", ")
        ))
    })
}

/// Rounds a width up to the next step the appliance offers, capped at full
pub fn snap_width(width: u32) -> u32 {
    let snapped = WIDTH_STEPS
        .iter()
        .map(|(_, step)| *step)
        .find(|step| *step >= width)
        .unwrap_or(MAX_WIDTH);
    if snapped != width {
        warn!("Width {}° is not a supported step, using {}°", width, snapped);
    }
    snapped
}

pub fn step_name(width: u32) -> Option<&'static str> {
    WIDTH_STEPS
        .iter()
        .find(|(_, step)| *step == width)
        .map(|(name, _)| *name)
}

fn angular_distance(a: u32, b: u32) -> u32 {
    let diff = a.abs_diff(b);
    diff.min(360 - diff)
}

fn sweep(heading: u32, half: u32) -> (u32, u32) {
    ((heading + 360 - half) % 360, (heading + half) % 360)
}

fn in_bounds(lower: u32, upper: u32) -> bool {
    lower <= upper && lower >= MIN_ANGLE && upper <= MAX_ANGLE
}

/// Validated oscillation settings ready to publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OscillationPlan {
    pub width: u32,
    pub heading: u32,
    pub lower_angle: u32,
    pub upper_angle: u32,
    /// Heading the caller asked for, when it had to be moved
    pub requested_heading: Option<u32>,
}

impl OscillationPlan {
    /// Plans a sweep of `width` degrees centred on `heading`
    ///
    /// A width of 0 points the fan at `heading` with oscillation off. Widths
    /// of 45°-350° sweep around the heading; if that sweep would wrap past 0°
    /// or leave 5°-355°, the heading moves to the nearest position where the
    /// full width fits.
    pub fn new(width: u32, heading: u32) -> Result<Self, CommandError> {
        if heading > 359 {
            return Err(CommandError::HeadingOutOfRange(heading));
        }
        if width == 0 {
            return Ok(Self {
                width,
                heading,
                lower_angle: heading,
                upper_angle: heading,
                requested_heading: None,
            });
        }
        if !(MIN_WIDTH..=MAX_WIDTH).contains(&width) {
            return Err(CommandError::InvalidWidth(format!(
                "{}° (expected 0 or {}-{})",
                width, MIN_WIDTH, MAX_WIDTH
            )));
        }

        let half = width / 2;
        let (mut lower, mut upper) = sweep(heading, half);
        let mut centre = heading;

        if !in_bounds(lower, upper) {
            let candidates = [MIN_ANGLE + half, MAX_ANGLE - half];
            let best = candidates
                .iter()
                .copied()
                .filter(|candidate| {
                    let (lower, upper) = sweep(*candidate, half);
                    in_bounds(lower, upper)
                })
                .min_by_key(|candidate| angular_distance(heading, *candidate))
                .ok_or_else(|| {
                    CommandError::InvalidWidth(format!(
                        "{}° does not fit within {}°-{}°",
                        width, MIN_ANGLE, MAX_ANGLE
                    ))
                })?;

            warn!(
                "Moved heading from {}° to {}° so a {}° sweep stays within {}°-{}°",
                heading, best, width, MIN_ANGLE, MAX_ANGLE
            );
            centre = best;
            (lower, upper) = sweep(centre, half);
        }

        debug!(
            "Oscillation plan: width {}°, heading {}°, angles {}°-{}°",
            width, centre, lower, upper
        );
        Ok(Self {
            width,
            heading: centre,
            lower_angle: lower,
            upper_angle: upper,
            requested_heading: (centre != heading).then_some(heading),
        })
    }

    pub fn is_adjusted(&self) -> bool {
        self.requested_heading.is_some()
    }

    pub fn fields(&self) -> CommandFields {
        let mut fields = CommandFields::new();
        fields.insert("osal".to_string(), padded(self.lower_angle));
        fields.insert("osau".to_string(), padded(self.upper_angle));

        if self.width == 0 {
            fields.insert("oscs".to_string(), "OFF".to_string());
            fields.insert("oson".to_string(), "OFF".to_string());
        } else {
            fields.insert("oscs".to_string(), "ON".to_string());
            fields.insert("oson".to_string(), "ON".to_string());
            fields.insert("ancp".to_string(), "CUST".to_string());
        }
        fields
    }
}

/// Stops sweeping and leaves the fan where it is
pub fn stop_oscillation() -> CommandFields {
    let mut fields = field("oscs", "OFF");
    fields.insert("oson".to_string(), "OFF".to_string());
    fields
}

/// Width and heading recovered from the appliance's raw angles
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OscillationInfo {
    pub width: u32,
    pub heading: u32,
    pub lower_angle: u32,
    pub upper_angle: u32,
    pub wrap_around: bool,
}

impl OscillationInfo {
    pub fn from_angles(osal: &str, osau: &str) -> Result<Self, CommandError> {
        let lower = parse_angle(osal)?;
        let upper = parse_angle(osau)?;

        let (width, heading) = if lower <= upper {
            (upper - lower, (lower + upper) / 2)
        } else {
            (360 - lower + upper, ((lower + upper + 360) / 2) % 360)
        };

        Ok(Self {
            width,
            heading,
            lower_angle: lower,
            upper_angle: upper,
            wrap_around: lower > upper,
        })
    }

    /// Reads the angles out of a state snapshot, if both are present
    pub fn from_snapshot(snapshot: &DeviceSnapshot) -> Option<Self> {
        let osal = snapshot.setting("osal")?;
        let osau = snapshot.setting("osau")?;
        Self::from_angles(osal, osau).ok()
    }
}

fn parse_angle(value: &str) -> Result<u32, CommandError> {
    value
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|angle| *angle < 360)
        .ok_or_else(|| CommandError::InvalidAngle(value.to_string()))
}

/// Best guess at where the fan currently points
///
/// Uses the centre of the configured sweep, then the reported position
/// (`apos`), then [`DEFAULT_HEADING`].
pub fn current_heading(snapshot: &DeviceSnapshot) -> u32 {
    if let Some(info) = OscillationInfo::from_snapshot(snapshot) {
        return info.heading;
    }
    snapshot
        .setting("apos")
        .and_then(|apos| parse_angle(apos).ok())
        .unwrap_or_else(|| {
            warn!(
                "No position in device state, using {}°",
                DEFAULT_HEADING
            );
            DEFAULT_HEADING
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_width_names_and_degrees() {
        assert_eq!(parse_width("off"), Ok(0));
        assert_eq!(parse_width("Narrow"), Ok(45));
        assert_eq!(parse_width("medium"), Ok(90));
        assert_eq!(parse_width("wide"), Ok(180));
        assert_eq!(parse_width("FULL"), Ok(350));
        assert_eq!(parse_width("120"), Ok(120));
        assert!(matches!(
            parse_width("sideways"),
            Err(CommandError::InvalidWidth(_))
        ));
    }

    #[test]
    fn test_snap_width_rounds_up_to_step() {
        assert_eq!(snap_width(0), 0);
        assert_eq!(snap_width(30), 45);
        assert_eq!(snap_width(90), 90);
        assert_eq!(snap_width(100), 180);
        assert_eq!(snap_width(400), 350);
        assert_eq!(step_name(180), Some("wide"));
        assert_eq!(step_name(120), None);
    }

    #[test]
    fn test_centred_sweep() {
        let plan = OscillationPlan::new(90, 180).unwrap();
        assert_eq!((plan.lower_angle, plan.upper_angle), (135, 225));
        assert_eq!(plan.heading, 180);
        assert!(!plan.is_adjusted());

        let fields = plan.fields();
        assert_eq!(fields["osal"], "0135");
        assert_eq!(fields["osau"], "0225");
        assert_eq!(fields["oscs"], "ON");
        assert_eq!(fields["oson"], "ON");
        assert_eq!(fields["ancp"], "CUST");
    }

    #[test]
    fn test_heading_moves_to_keep_sweep_in_bounds() {
        // 10° - 45 would wrap below zero, nearest fit puts the lower bound at 5°.
        let plan = OscillationPlan::new(90, 10).unwrap();
        assert_eq!(plan.heading, 50);
        assert_eq!((plan.lower_angle, plan.upper_angle), (5, 95));
        assert_eq!(plan.requested_heading, Some(10));

        let plan = OscillationPlan::new(90, 340).unwrap();
        assert_eq!(plan.heading, 310);
        assert_eq!((plan.lower_angle, plan.upper_angle), (265, 355));
    }

    #[test]
    fn test_full_width_is_pinned() {
        let plan = OscillationPlan::new(350, 90).unwrap();
        assert_eq!((plan.lower_angle, plan.upper_angle), (5, 355));
        assert_eq!(plan.heading, 180);
    }

    #[test]
    fn test_zero_width_points_without_oscillating() {
        let plan = OscillationPlan::new(0, 90).unwrap();
        let fields = plan.fields();
        assert_eq!(fields["osal"], "0090");
        assert_eq!(fields["osau"], "0090");
        assert_eq!(fields["oscs"], "OFF");
        assert_eq!(fields["oson"], "OFF");
        assert!(!fields.contains_key("ancp"));
    }

    #[test]
    fn test_rejects_invalid_plans() {
        assert_eq!(
            OscillationPlan::new(90, 360),
            Err(CommandError::HeadingOutOfRange(360))
        );
        assert!(matches!(
            OscillationPlan::new(30, 180),
            Err(CommandError::InvalidWidth(_))
        ));
        assert!(matches!(
            OscillationPlan::new(351, 180),
            Err(CommandError::InvalidWidth(_))
        ));
    }

    #[test]
    fn test_stop_oscillation_fields() {
        let fields = stop_oscillation();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["oscs"], "OFF");
        assert_eq!(fields["oson"], "OFF");
    }

    #[test]
    fn test_info_from_angles() {
        let info = OscillationInfo::from_angles("0054", "0234").unwrap();
        assert_eq!((info.width, info.heading), (180, 144));
        assert!(!info.wrap_around);

        let info = OscillationInfo::from_angles("0350", "0010").unwrap();
        assert_eq!((info.width, info.heading), (20, 0));
        assert!(info.wrap_around);

        assert!(matches!(
            OscillationInfo::from_angles("abc", "0010"),
            Err(CommandError::InvalidAngle(_))
        ));
    }

    #[test]
    fn test_current_heading_falls_back() {
        let mut snapshot = DeviceSnapshot::default();
        assert_eq!(current_heading(&snapshot), DEFAULT_HEADING);

        snapshot.product_state.insert("apos".to_string(), "0128".to_string());
        assert_eq!(current_heading(&snapshot), 128);

        snapshot.product_state.insert("osal".to_string(), "0083".to_string());
        snapshot.product_state.insert("osau".to_string(), "0173".to_string());
        assert_eq!(current_heading(&snapshot), 128);
    }
}
