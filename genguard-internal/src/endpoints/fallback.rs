use axum::http::{Method, Uri};

use crate::error::{Error, ErrorDetails};

pub async fn handle_404(uri: Uri) -> Error {
    Error::new(ErrorDetails::RouteNotFound {
        path: uri.path().to_string(),
    })
}

pub async fn handle_405(method: Method, uri: Uri) -> Error {
    Error::new(ErrorDetails::MethodNotAllowed {
        method: method.to_string(),
        path: uri.path().to_string(),
    })
}
