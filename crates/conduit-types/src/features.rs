use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Readiness levels a bound object can be brought to.
    ///
    /// Features are activated incrementally; some imply others
    /// (`CONTROLS` needs `PARAM_PROPS`, every cache needs `PROXY`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Features: u32 {
        /// A transport-side handle exists for the object.
        const PROXY = 1 << 0;
        /// The object is known to the server under a global id.
        const BOUND = 1 << 1;
        /// Native info properties are cached.
        const INFO = 1 << 4;
        const PARAM_PROPS = 1 << 5;
        const PARAM_FORMAT = 1 << 6;
        const PARAM_PROFILE = 1 << 7;
        const PARAM_PORT_CONFIG = 1 << 8;
        const PARAM_ROUTE = 1 << 9;
        /// Endpoint controls derived from the props parameter.
        const CONTROLS = 1 << 16;
        /// Every metadata entry has been received.
        const METADATA_DATA = 1 << 17;

        const MINIMAL = Self::PROXY.bits() | Self::BOUND.bits();
        const STANDARD = Self::MINIMAL.bits() | Self::INFO.bits();
        const ALL_PARAMS = Self::PARAM_PROPS.bits()
            | Self::PARAM_FORMAT.bits()
            | Self::PARAM_PROFILE.bits()
            | Self::PARAM_PORT_CONFIG.bits()
            | Self::PARAM_ROUTE.bits();
    }
}

bitflags::bitflags! {
    /// Access rights the server grants on a global, using the server's own
    /// octal bit values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Permissions: u32 {
        const R = 0o400;
        const W = 0o200;
        const X = 0o100;
        const M = 0o010;
    }
}

impl Permissions {
    /// Render as the familiar `rwxm` string, with `-` for missing bits.
    pub fn to_rwxm(&self) -> String {
        [
            (Permissions::R, 'r'),
            (Permissions::W, 'w'),
            (Permissions::X, 'x'),
            (Permissions::M, 'm'),
        ]
        .iter()
        .map(|(bit, c)| if self.contains(*bit) { *c } else { '-' })
        .collect()
    }
}

/// Parameter families an object can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParamKind {
    Props,
    Format,
    Profile,
    PortConfig,
    Route,
}

impl ParamKind {
    pub const ALL: [ParamKind; 5] = [
        ParamKind::Props,
        ParamKind::Format,
        ParamKind::Profile,
        ParamKind::PortConfig,
        ParamKind::Route,
    ];

    /// The feature bit that becomes active once this parameter is cached.
    pub fn feature(&self) -> Features {
        match self {
            ParamKind::Props => Features::PARAM_PROPS,
            ParamKind::Format => Features::PARAM_FORMAT,
            ParamKind::Profile => Features::PARAM_PROFILE,
            ParamKind::PortConfig => Features::PARAM_PORT_CONFIG,
            ParamKind::Route => Features::PARAM_ROUTE,
        }
    }

    /// Lowest-valued parameter whose feature is contained in `features`.
    pub fn first_in(features: Features) -> Option<ParamKind> {
        ParamKind::ALL.into_iter().find(|p| features.contains(p.feature()))
    }
}
