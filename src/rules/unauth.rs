//! Unauthenticated-variant derivation.

use crate::message::{ParamKind, RequestSnapshot};

/// Strip all credential material carried in cookies: every cookie-typed
/// parameter and every `Cookie` header.
///
/// Pure with respect to its input; returns `None` when the request carried no
/// cookies, so callers never see a spurious identical copy.
pub fn strip_credentials(request: &RequestSnapshot) -> Option<RequestSnapshot> {
    let mut current = request.clone();

    for param in request.parameters() {
        if param.kind == ParamKind::Cookie {
            current = current.with_removed_param(&param);
        }
    }

    for header in request.headers() {
        if header.name.eq_ignore_ascii_case("cookie") {
            current = current.with_removed_header(header);
        }
    }

    if current.to_text() != request.to_text() {
        Some(current)
    } else {
        None
    }
}
