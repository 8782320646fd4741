//! Whitelist permission model for compiled strategies.
//!
//! A [`PermissionPolicy`] names what a strategy may use. Building it into an
//! [`ExecutionNamespace`] resolves every symbol the compiler understands to
//! either an allowed binding or a deny proxy. The compiler asks the
//! namespace about each import, builtin call, module member and data
//! attribute, and the sandbox links host imports only for allowed symbols.
//!
//! # Examples
//!
//! ```
//! use stratguard_runtime::permissions::{Decision, Operation, PermissionChecker, PermissionPolicy};
//!
//! let checker = PermissionChecker::new(PermissionPolicy::default());
//! assert!(checker.check(&Operation::CallBuiltin("abs".into())).is_allowed());
//! assert!(checker.check(&Operation::ModuleMember {
//!     module: "math".into(),
//!     member: "sqrt".into(),
//! }).is_allowed());
//!
//! match checker.check(&Operation::CallBuiltin("open".into())) {
//!     Decision::Deny(reason) => assert!(reason.to_string().contains("filesystem")),
//!     Decision::Allow => unreachable!(),
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use stratguard_core::PolicyConfig;

/// Builtins the compiler can lower.
pub const BUILTIN_CATALOGUE: &[&str] = &[
    "abs", "min", "max", "len", "range", "round", "int", "float", "bool",
];

/// `math` members the compiler can lower.
pub const MATH_CATALOGUE: &[&str] = &[
    "sqrt", "floor", "ceil", "trunc", "fabs", "log", "log10", "exp", "tanh", "pow", "isnan",
    "isfinite", "pi", "e", "inf",
];

/// Attributes on market data and signal maps.
pub const ATTRIBUTE_CATALOGUE: &[&str] = &["open", "high", "low", "close", "volume", "get"];

/// Modules whose import is understood. `typing` imports are accepted for
/// annotations and have no runtime effect.
pub const MODULE_CATALOGUE: &[&str] = &["math", "typing"];

/// `math` members implemented by host imports rather than native opcodes.
pub const HOST_MATH_MEMBERS: &[&str] = &["log", "log10", "exp", "tanh", "pow"];

/// Class of capability a denied symbol would grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Reading or writing files
    Filesystem,
    /// Opening connections
    Network,
    /// Spawning or signalling processes
    Process,
    /// Reading the environment or interactive input
    Environment,
    /// Evaluating code built at runtime
    DynamicEval,
    /// Walking the object graph
    Reflection,
}

impl Capability {
    /// Policy-level name of the capability.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem access",
            Self::Network => "network access",
            Self::Process => "process control",
            Self::Environment => "environment access",
            Self::DynamicEval => "dynamic code evaluation",
            Self::Reflection => "reflection",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DANGEROUS_BUILTINS: &[(&str, Capability)] = &[
    ("open", Capability::Filesystem),
    ("input", Capability::Environment),
    ("print", Capability::Environment),
    ("breakpoint", Capability::Process),
    ("exit", Capability::Process),
    ("quit", Capability::Process),
    ("eval", Capability::DynamicEval),
    ("exec", Capability::DynamicEval),
    ("compile", Capability::DynamicEval),
    ("__import__", Capability::DynamicEval),
    ("globals", Capability::Reflection),
    ("locals", Capability::Reflection),
    ("vars", Capability::Reflection),
    ("dir", Capability::Reflection),
    ("type", Capability::Reflection),
    ("id", Capability::Reflection),
    ("getattr", Capability::Reflection),
    ("setattr", Capability::Reflection),
    ("delattr", Capability::Reflection),
    ("hasattr", Capability::Reflection),
    ("memoryview", Capability::Reflection),
];

const DANGEROUS_MODULES: &[(&str, Capability)] = &[
    ("os", Capability::Process),
    ("subprocess", Capability::Process),
    ("multiprocessing", Capability::Process),
    ("signal", Capability::Process),
    ("pty", Capability::Process),
    ("ctypes", Capability::Process),
    ("sys", Capability::Environment),
    ("shutil", Capability::Filesystem),
    ("pathlib", Capability::Filesystem),
    ("tempfile", Capability::Filesystem),
    ("glob", Capability::Filesystem),
    ("io", Capability::Filesystem),
    ("pickle", Capability::DynamicEval),
    ("marshal", Capability::DynamicEval),
    ("importlib", Capability::DynamicEval),
    ("builtins", Capability::DynamicEval),
    ("socket", Capability::Network),
    ("urllib", Capability::Network),
    ("requests", Capability::Network),
    ("http", Capability::Network),
    ("ftplib", Capability::Network),
    ("smtplib", Capability::Network),
    ("asyncio", Capability::Network),
    ("threading", Capability::Process),
    ("inspect", Capability::Reflection),
    ("gc", Capability::Reflection),
    ("types", Capability::Reflection),
];

/// What a strategy may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionPolicy {
    allowed_modules: BTreeSet<String>,
    allowed_builtins: BTreeSet<String>,
    denied_operations: BTreeSet<String>,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self::from_config(&PolicyConfig::default())
    }
}

impl PermissionPolicy {
    /// Builds a policy from explicit lists.
    #[must_use]
    pub fn new<M, B, D>(modules: M, builtins: B, denied: D) -> Self
    where
        M: IntoIterator,
        M::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self {
            allowed_modules: modules.into_iter().map(Into::into).collect(),
            allowed_builtins: builtins.into_iter().map(Into::into).collect(),
            denied_operations: denied.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds a policy from the `[policy]` configuration table.
    #[must_use]
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(
            config.modules.iter().cloned(),
            config.builtins.iter().cloned(),
            config.denied.iter().cloned(),
        )
    }

    /// Allowed module names.
    #[must_use]
    pub const fn allowed_modules(&self) -> &BTreeSet<String> {
        &self.allowed_modules
    }

    /// Allowed builtin names.
    #[must_use]
    pub const fn allowed_builtins(&self) -> &BTreeSet<String> {
        &self.allowed_builtins
    }

    /// Explicitly denied symbols (`abs`, `math`, `math.pow`, `close`, ...).
    #[must_use]
    pub const fn denied_operations(&self) -> &BTreeSet<String> {
        &self.denied_operations
    }
}

/// A use of a symbol the compiler asks permission for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `import module`
    Import(String),
    /// `name(...)` for a builtin
    CallBuiltin(String),
    /// `module.member`
    ModuleMember {
        /// Module name
        module: String,
        /// Member name
        member: String,
    },
    /// `value.name` on market data or a signal map
    Attribute(String),
}

impl Operation {
    fn key(&self) -> String {
        match self {
            Self::Import(module) => format!("import:{module}"),
            Self::CallBuiltin(name) => format!("builtin:{name}"),
            Self::ModuleMember { module, member } => format!("member:{module}.{member}"),
            Self::Attribute(name) => format!("attr:{name}"),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Import(module) => write!(f, "import of '{module}'"),
            Self::CallBuiltin(name) => write!(f, "call to builtin '{name}'"),
            Self::ModuleMember { module, member } => write!(f, "use of '{module}.{member}'"),
            Self::Attribute(name) => write!(f, "attribute '{name}'"),
        }
    }
}

/// Why an operation was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenyReason {
    /// Capability the symbol would grant, for known-dangerous symbols
    pub capability: Option<Capability>,
    /// Policy-level description
    pub message: String,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Answer to a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The operation is granted
    Allow,
    /// The operation is refused
    Deny(DenyReason),
}

impl Decision {
    /// Whether the operation is granted.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Converts a denial into [`stratguard_core::Error::SecurityViolation`].
    ///
    /// # Errors
    ///
    /// Returns the violation when the decision is [`Decision::Deny`].
    pub fn into_result(self) -> stratguard_core::Result<()> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny(reason) => Err(stratguard_core::Error::SecurityViolation {
                reason: reason.message,
                report: None,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    Allowed,
    DenyProxy(DenyReason),
}

/// Resolved symbol table for one policy.
///
/// Every catalogue symbol and every known-dangerous symbol has a binding;
/// anything else is denied as unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionNamespace {
    bindings: BTreeMap<String, Binding>,
}

impl ExecutionNamespace {
    /// Resolves an operation.
    #[must_use]
    pub fn check(&self, operation: &Operation) -> Decision {
        match self.bindings.get(&operation.key()) {
            Some(Binding::Allowed) => Decision::Allow,
            Some(Binding::DenyProxy(reason)) => Decision::Deny(reason.clone()),
            None => Decision::Deny(DenyReason {
                capability: None,
                message: format!("{operation} is not available to strategies"),
            }),
        }
    }

    /// Whether `math.member` is allowed.
    #[must_use]
    pub fn allows_math(&self, member: &str) -> bool {
        self.check(&Operation::ModuleMember {
            module: "math".to_string(),
            member: member.to_string(),
        })
        .is_allowed()
    }

    /// Allowed `math` members that need a host import.
    pub fn host_math_imports(&self) -> impl Iterator<Item = &'static str> + '_ {
        HOST_MATH_MEMBERS
            .iter()
            .copied()
            .filter(|member| self.allows_math(member))
    }

    /// Number of allowed bindings.
    #[must_use]
    pub fn allowed_count(&self) -> usize {
        self.bindings
            .values()
            .filter(|b| matches!(b, Binding::Allowed))
            .count()
    }
}

/// Builds namespaces and answers permission checks for one policy.
#[derive(Debug, Clone)]
pub struct PermissionChecker {
    policy: Arc<PermissionPolicy>,
    namespace: Arc<ExecutionNamespace>,
}

impl PermissionChecker {
    /// Creates a checker and resolves its namespace.
    #[must_use]
    pub fn new(policy: PermissionPolicy) -> Self {
        let namespace = Arc::new(build_namespace(&policy));
        Self {
            policy: Arc::new(policy),
            namespace,
        }
    }

    /// The policy in force.
    #[must_use]
    pub fn policy(&self) -> &PermissionPolicy {
        &self.policy
    }

    /// Shared namespace.
    #[must_use]
    pub fn namespace(&self) -> Arc<ExecutionNamespace> {
        Arc::clone(&self.namespace)
    }

    /// Resolves an operation against the namespace.
    #[must_use]
    pub fn check(&self, operation: &Operation) -> Decision {
        self.namespace.check(operation)
    }
}

/// Resolves `policy` into an [`ExecutionNamespace`].
///
/// Exposes `catalogue ∩ allowed − denied`, with deny proxies for
/// known-dangerous symbols.
#[must_use]
pub fn build_namespace(policy: &PermissionPolicy) -> ExecutionNamespace {
    let mut bindings = BTreeMap::new();
    let denied = &policy.denied_operations;

    for (name, capability) in DANGEROUS_BUILTINS {
        bindings.insert(
            Operation::CallBuiltin((*name).to_string()).key(),
            deny_proxy(*capability, &format!("builtin '{name}'")),
        );
    }
    for (module, capability) in DANGEROUS_MODULES {
        bindings.insert(
            Operation::Import((*module).to_string()).key(),
            deny_proxy(*capability, &format!("module '{module}'")),
        );
    }

    for name in BUILTIN_CATALOGUE {
        let binding = if denied.contains(*name) {
            explicit_denial(&format!("builtin '{name}'"))
        } else if policy.allowed_builtins.contains(*name) {
            Binding::Allowed
        } else {
            not_granted(&format!("builtin '{name}'"))
        };
        bindings.insert(Operation::CallBuiltin((*name).to_string()).key(), binding);
    }

    for module in MODULE_CATALOGUE {
        let module_binding = if denied.contains(*module) {
            explicit_denial(&format!("module '{module}'"))
        } else if policy.allowed_modules.contains(*module) {
            Binding::Allowed
        } else {
            not_granted(&format!("module '{module}'"))
        };
        let module_allowed = module_binding == Binding::Allowed;
        bindings.insert(Operation::Import((*module).to_string()).key(), module_binding);

        if *module == "math" {
            for member in MATH_CATALOGUE {
                let qualified = format!("math.{member}");
                let binding = if denied.contains(&qualified) {
                    explicit_denial(&format!("'{qualified}'"))
                } else if module_allowed {
                    Binding::Allowed
                } else {
                    not_granted(&format!("'{qualified}'"))
                };
                let op = Operation::ModuleMember {
                    module: "math".to_string(),
                    member: (*member).to_string(),
                };
                bindings.insert(op.key(), binding);
            }
        }
    }

    for attr in ATTRIBUTE_CATALOGUE {
        let binding = if denied.contains(*attr) {
            explicit_denial(&format!("attribute '{attr}'"))
        } else {
            Binding::Allowed
        };
        bindings.insert(Operation::Attribute((*attr).to_string()).key(), binding);
    }

    let namespace = ExecutionNamespace { bindings };
    tracing::debug!(
        allowed = namespace.allowed_count(),
        denied = policy.denied_operations.len(),
        "execution namespace built"
    );
    namespace
}

fn deny_proxy(capability: Capability, subject: &str) -> Binding {
    Binding::DenyProxy(DenyReason {
        capability: Some(capability),
        message: format!("{subject} grants {capability}, which strategies may not use"),
    })
}

fn explicit_denial(subject: &str) -> Binding {
    Binding::DenyProxy(DenyReason {
        capability: None,
        message: format!("{subject} is denied by policy"),
    })
}

fn not_granted(subject: &str) -> Binding {
    Binding::DenyProxy(DenyReason {
        capability: None,
        message: format!("{subject} is not granted by policy"),
    })
}
