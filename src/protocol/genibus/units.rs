use std::collections::HashMap;

use once_cell::sync::Lazy;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Quantity {
    Temperature,
    Power,
    Current,
    Pressure,
    Percentage,
    Flow,
    Frequency,
}

/// A GENIbus unit: the label a device reports and the factor to the base unit of its quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Unit {
    pub label: &'static str,
    pub factor: f64,
    pub quantity: Quantity,
}

const fn unit(label: &'static str, factor: f64, quantity: Quantity) -> Unit {
    Unit {
        label,
        factor,
        quantity,
    }
}

// Pressure and water head share base unit bar.
static UNITS: Lazy<HashMap<u8, Unit>> = Lazy::new(|| {
    use Quantity::*;
    HashMap::from([
        (20, unit("Celsius/10", 0.1, Temperature)),
        (21, unit("Celsius", 1.0, Temperature)),
        (57, unit("Fahrenheit", 1.0, Temperature)),
        (84, unit("Kelvin/100", 0.01, Temperature)),
        (110, unit("diff-Kelvin/100", 0.01, Temperature)),
        (111, unit("diff-Kelvin", 1.0, Temperature)),
        (7, unit("Watt", 1.0, Power)),
        (8, unit("Watt*10", 10.0, Power)),
        (9, unit("Watt*100", 100.0, Power)),
        (44, unit("kW", 1000.0, Power)),
        (45, unit("kW*10", 10000.0, Power)),
        (1, unit("Ampere*0.1", 0.1, Current)),
        (51, unit("bar/1000", 0.001, Pressure)),
        (27, unit("bar/100", 0.01, Pressure)),
        (28, unit("bar/10", 0.1, Pressure)),
        (29, unit("bar", 1.0, Pressure)),
        (61, unit("kPa", 0.01, Pressure)),
        (55, unit("psi", 0.06895, Pressure)),
        (60, unit("psi*10", 0.6895, Pressure)),
        (91, unit("m/10000", 0.000001, Pressure)),
        (83, unit("m/100", 0.001, Pressure)),
        (24, unit("m/10", 0.01, Pressure)),
        (25, unit("m", 0.1, Pressure)),
        (26, unit("m*10", 1.0, Pressure)),
        (113, unit("ppm", 0.000001, Percentage)),
        (107, unit("0.01%", 0.01, Percentage)),
        (12, unit("0.1%", 0.1, Percentage)),
        (30, unit("1%", 1.0, Percentage)),
        (76, unit("10%", 10.0, Percentage)),
        (22, unit("0.1*m³/h", 0.1, Flow)),
        (23, unit("m³/h", 1.0, Flow)),
        (41, unit("5*m³/h", 5.0, Flow)),
        (92, unit("10*m³/h", 10.0, Flow)),
        (105, unit("0.01*Hz", 0.01, Frequency)),
        (11, unit("0.5*Hz", 0.5, Frequency)),
        (16, unit("Hz", 1.0, Frequency)),
        (38, unit("2*Hz", 2.0, Frequency)),
        (17, unit("2.5*Hz", 2.5, Frequency)),
    ])
});

pub fn lookup_unit(index: u8) -> Option<&'static Unit> {
    UNITS.get(&index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let unit = lookup_unit(20).map(|u| (u.label, u.quantity));
        assert_eq!(unit, Some(("Celsius/10", Quantity::Temperature)));
        assert_eq!(lookup_unit(11).map(|u| u.factor), Some(0.5));
        assert!(lookup_unit(0).is_none());
        assert_eq!(Quantity::Frequency.to_string(), "frequency");
    }
}
