/// How a raw register word is turned into a physical quantity.
///
/// The controller stores every reading as a two's complement word; the factor converts it into
/// the unit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DataType {
    factor: f64,
    unit: Unit,
}

impl DataType {
    // Convenience aliases for the nicely tabulated `for_each_register` macro definition below.
    pub const CEL: Self = Self { factor: 0.1, unit: Unit::Celsius };
    pub const BAR: Self = Self { factor: 0.1, unit: Unit::Bar };
    pub const LPM: Self = Self { factor: 0.1, unit: Unit::LitresPerMinute };
    pub const PCT: Self = Self { factor: 0.1, unit: Unit::Percent };
    /// Stored as revolutions per second times ten.
    pub const RPM: Self = Self { factor: 6.0, unit: Unit::RevolutionsPerMinute };
    pub const W: Self = Self { factor: 1.0, unit: Unit::Watt };

    pub const fn factor(&self) -> f64 {
        self.factor
    }

    pub const fn unit(&self) -> Unit {
        self.unit
    }

    pub fn decode(&self, raw: u16) -> f64 {
        f64::from(to_signed(raw)) * self.factor
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum Unit {
    #[strum(serialize = "°C")]
    Celsius,
    #[strum(serialize = "bar")]
    Bar,
    #[strum(serialize = "L/min")]
    LitresPerMinute,
    #[strum(serialize = "%")]
    Percent,
    #[strum(serialize = "rpm")]
    RevolutionsPerMinute,
    #[strum(serialize = "W")]
    Watt,
}

impl serde::Serialize for Unit {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.into())
    }
}

/// Reinterpret a raw register word as a two's complement signed integer.
pub const fn to_signed(raw: u16) -> i16 {
    raw as i16
}

/// The content of one register as seen by a poll cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterValue {
    Value(u16),
    /// The register could not be read in the most recent cycle.
    Unavailable,
}

impl RegisterValue {
    pub fn raw(self) -> Option<u16> {
        match self {
            RegisterValue::Value(v) => Some(v),
            RegisterValue::Unavailable => None,
        }
    }

    pub fn is_available(self) -> bool {
        self.raw().is_some()
    }
}

impl std::fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            RegisterValue::Value(n) => f.write_fmt(format_args!("{}", n)),
            RegisterValue::Unavailable => f.write_str("unavailable"),
        }
    }
}

impl serde::Serialize for RegisterValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            RegisterValue::Value(n) => serializer.serialize_u16(n),
            RegisterValue::Unavailable => serializer.serialize_none(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterIndex(usize);

impl RegisterIndex {
    pub fn from_address(address: u16) -> Option<RegisterIndex> {
        let index = ADDRESSES.partition_point(|v| *v < address);
        (ADDRESSES.get(index) == Some(&address)).then_some(Self(index))
    }

    pub fn from_name(name: &str) -> Option<RegisterIndex> {
        let index = NAMES.iter().position(|v| v.eq_ignore_ascii_case(name));
        index.map(Self)
    }

    pub fn all() -> impl Iterator<Item = RegisterIndex> {
        (0..ADDRESSES.len()).map(Self)
    }

    pub fn address(&self) -> u16 {
        ADDRESSES[self.0]
    }

    pub fn name(&self) -> &'static str {
        NAMES[self.0]
    }

    pub fn data_type(&self) -> DataType {
        DATA_TYPES[self.0]
    }

    pub fn description(&self) -> &'static str {
        DESCRIPTIONS[self.0]
    }
}

macro_rules! for_each_register {
    ($m:ident) => {
        $m! {
            2: CEL, "BUFFER_TANK_TEMPERATURE", "Heating/cooling buffer tank temperature";
            3: CEL, "HOT_WATER_TEMPERATURE", "Hot water temperature";
            4: CEL, "HP_INLET_TEMPERATURE", "Heat pump inlet temperature";
            5: LPM, "FLOW", "Flow";
            6: CEL, "COMPRESSOR_HEAD_TEMPERATURE", "Compressor head temperature";
            7: CEL, "HP_OUTLET_TEMPERATURE", "Heat pump outlet temperature";
            8: CEL, "EXTERNAL_TEMPERATURE", "External temperature";
            9: CEL, "DRAIN_TEMPERATURE", "Drain temperature";
            10: CEL, "SUCTION_TEMPERATURE", "Suction temperature";
            11: BAR, "HIGH_PRESSURE", "High pressure";
            12: BAR, "LOW_PRESSURE", "Low pressure";
            13: CEL, "EVAPORATION", "Evaporation temperature";
            14: CEL, "CONDENSATION", "Condensation temperature";
            15: CEL, "SUPERHEAT", "Superheat";
            18: RPM, "COMPRESSOR_SPEED", "Compressor speed";
            65: CEL, "COOLING_SETPOINT", "Cooling setpoint";
            66: CEL, "HEATING_SETPOINT", "Heating setpoint";
            67: CEL, "HOT_WATER_SETPOINT", "Hot water setpoint";
            68: CEL, "HEATING_COOLING_SETPOINT", "Heating/cooling setpoint";
            70: PCT, "EEV", "Electronic expansion valve opening";
            72: PCT, "INJECTION", "Injection valve opening";
            73: CEL, "TJ", "TJ temperature";
            234: W, "POWER_CONSUMPTION", "Electrical power consumption";
        }
    };
}

macro_rules! make_lists {
    ($($regnum: literal: $dt: ident, $name: literal, $description: literal;)+) => {
        pub static ADDRESSES: &[u16] = &[$($regnum),*];
        pub static NAMES: &[&str] = &[$($name),*];
        pub static DATA_TYPES: &[DataType] = &[$(DataType::$dt),*];
        pub static DESCRIPTIONS: &[&str] = &[$($description),*];
    };
}

for_each_register!(make_lists);

const _ASSERT_ADDRESSES_SORTED: () = const {
    let mut idx = 1;
    while idx < ADDRESSES.len() {
        assert!(ADDRESSES[idx - 1] < ADDRESSES[idx], "register table must be sorted");
        idx += 1;
    }
};

pub const COOLING_SETPOINT: u16 = 65;
pub const HEATING_SETPOINT: u16 = 66;
pub const HOT_WATER_SETPOINT: u16 = 67;
