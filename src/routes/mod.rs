/// Router Module Index
///
/// One module per access level. Each gated module attaches its own guard, so the
/// roles a view admits are declared next to the routes themselves.

/// Routes reachable without a session (sign-in flow, session probe, health).
pub mod public;

/// Routes for any signed-in user.
pub mod authenticated;

/// Routes restricted to the 'admin' role.
pub mod admin;

/// Routes for registry staff (admins included).
pub mod staff;

/// Routes restricted to the 'student' role.
pub mod student;
