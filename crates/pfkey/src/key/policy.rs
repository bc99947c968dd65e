//! Security policy model.

use std::fmt;
use std::net::IpAddr;

use super::direction::Direction;
use super::index::SecurityIndex;
use super::message::IpsecProtocol;
use super::sadb::SaKey;

/// Policy kind as carried in the policy extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    Discard,
    None,
    Ipsec,
    Entrust,
    Bypass,
}

impl PolicyKind {
    /// Parse a wire policy type.
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::Discard),
            1 => Some(Self::None),
            2 => Some(Self::Ipsec),
            3 => Some(Self::Entrust),
            4 => Some(Self::Bypass),
            _ => None,
        }
    }

    /// Wire policy type.
    pub fn number(self) -> u16 {
        match self {
            Self::Discard => 0,
            Self::None => 1,
            Self::Ipsec => 2,
            Self::Entrust => 3,
            Self::Bypass => 4,
        }
    }
}

/// IPsec mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Any,
    Transport,
    Tunnel,
}

impl Mode {
    /// Parse a wire mode.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Any),
            1 => Some(Self::Transport),
            2 => Some(Self::Tunnel),
            _ => None,
        }
    }

    /// Wire mode.
    pub fn number(self) -> u8 {
        match self {
            Self::Any => 0,
            Self::Transport => 1,
            Self::Tunnel => 2,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Any => "any",
            Self::Transport => "transport",
            Self::Tunnel => "tunnel",
        })
    }
}

/// How strictly a request must be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Default,
    Use,
    Require,
    Unique,
}

impl Level {
    /// Parse a wire level.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Default),
            1 => Some(Self::Use),
            2 => Some(Self::Require),
            3 => Some(Self::Unique),
            _ => None,
        }
    }

    /// Wire level.
    pub fn number(self) -> u8 {
        match self {
            Self::Default => 0,
            Self::Use => 1,
            Self::Require => 2,
            Self::Unique => 3,
        }
    }

    /// Whether missing SAs block the traffic.
    pub fn is_required(self) -> bool {
        matches!(self, Self::Require | Self::Unique)
    }
}

/// One IPsec transform a policy asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    pub protocol: IpsecProtocol,
    pub mode: Mode,
    pub level: Level,
    pub reqid: u16,
    /// Tunnel endpoint for tunnel-mode requests.
    pub proxy: Option<IpAddr>,
}

impl RequestSpec {
    /// Transport-mode request at `Require` level.
    pub fn transport(protocol: IpsecProtocol) -> Self {
        Self {
            protocol,
            mode: Mode::Transport,
            level: Level::Require,
            reqid: 0,
            proxy: None,
        }
    }

    /// Tunnel-mode request at `Require` level.
    pub fn tunnel(protocol: IpsecProtocol, proxy: IpAddr) -> Self {
        Self {
            mode: Mode::Tunnel,
            proxy: Some(proxy),
            ..Self::transport(protocol)
        }
    }

    /// Set the request level.
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }
}

/// A request held by a stored policy, with the SA last matched for it.
#[derive(Debug, Clone)]
pub struct IpsecRequest {
    pub spec: RequestSpec,
    /// Counted reference to the SA matched for this request.
    pub sa: Option<SaKey>,
}

impl From<RequestSpec> for IpsecRequest {
    fn from(spec: RequestSpec) -> Self {
        Self { spec, sa: None }
    }
}

/// What a policy does with matching traffic.
#[derive(Debug, Clone)]
pub enum PolicyAction {
    Discard,
    None,
    Entrust,
    Bypass,
    Ipsec(Vec<IpsecRequest>),
}

impl PolicyAction {
    /// Build an IPsec action from request specs.
    pub fn ipsec(specs: impl IntoIterator<Item = RequestSpec>) -> Self {
        Self::Ipsec(specs.into_iter().map(IpsecRequest::from).collect())
    }

    /// Build an action from a wire kind and its requests.
    pub fn from_kind(kind: PolicyKind, specs: Vec<RequestSpec>) -> Self {
        match kind {
            PolicyKind::Discard => Self::Discard,
            PolicyKind::None => Self::None,
            PolicyKind::Entrust => Self::Entrust,
            PolicyKind::Bypass => Self::Bypass,
            PolicyKind::Ipsec => Self::ipsec(specs),
        }
    }

    /// The wire kind.
    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::Discard => PolicyKind::Discard,
            Self::None => PolicyKind::None,
            Self::Entrust => PolicyKind::Entrust,
            Self::Bypass => PolicyKind::Bypass,
            Self::Ipsec(_) => PolicyKind::Ipsec,
        }
    }

    /// The requests, empty for non-IPsec actions.
    pub fn requests(&self) -> &[IpsecRequest] {
        match self {
            Self::Ipsec(reqs) => reqs,
            _ => &[],
        }
    }

    pub fn requests_mut(&mut self) -> &mut [IpsecRequest] {
        match self {
            Self::Ipsec(reqs) => reqs,
            _ => &mut [],
        }
    }

    /// Request specs without SA references.
    pub fn specs(&self) -> Vec<RequestSpec> {
        self.requests().iter().map(|r| r.spec.clone()).collect()
    }
}

/// Policy lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyState {
    Alive,
    Dead,
}

/// Expiry limits of a policy, in seconds. Zero disables a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyLifetime {
    /// Maximum age since creation.
    pub lifetime: u64,
    /// Maximum idle time since last use.
    pub valid_time: u64,
}

/// A stored security policy.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    pub id: u32,
    pub index: SecurityIndex,
    pub direction: Direction,
    pub action: PolicyAction,
    pub state: PolicyState,
    pub limits: PolicyLifetime,
    pub created: u64,
    pub last_used: u64,
    pub(crate) refcnt: u32,
}

impl SecurityPolicy {
    /// Outstanding references, the database's own included.
    pub fn refcnt(&self) -> u32 {
        self.refcnt
    }

    /// Whether lookups may still return this policy.
    pub fn is_alive(&self) -> bool {
        self.state == PolicyState::Alive
    }

    /// Whether a lifetime or idle limit has passed at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        let PolicyLifetime {
            lifetime,
            valid_time,
        } = self.limits;
        (lifetime != 0 && now.saturating_sub(self.created) > lifetime)
            || (valid_time != 0 && now.saturating_sub(self.last_used) > valid_time)
    }
}
