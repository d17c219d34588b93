use actix_web::body::MessageBody;
use actix_web::dev::{ServiceFactory, ServiceRequest, ServiceResponse};
use actix_web::middleware::{from_fn, Logger};
use actix_web::{web, App};

use crate::cors::build_cors;
use crate::middleware::{correlation, rate_limit, recover_panics};
use crate::routes;
use crate::state::AppState;
use crate::timeout::RequestTimeout;

/// The full gateway application: routes plus the middleware stack.
///
/// Requests pass, outermost first, through logging, correlation IDs, CORS,
/// panic recovery, rate limiting and the global timeout guard. The AI scope
/// adds its own, shorter, guard.
pub fn build_app(
    state: web::Data<AppState>,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Response = ServiceResponse<impl MessageBody>,
        Config = (),
        InitError = (),
        Error = actix_web::Error,
    >,
> {
    let timeouts = state.config.timeouts;
    let cors = build_cors(&state.config.allowed_origins);

    App::new()
        .app_data(state)
        .wrap(RequestTimeout::new(timeouts.request))
        .wrap(from_fn(rate_limit))
        .wrap(from_fn(recover_panics))
        .wrap(cors)
        .wrap(from_fn(correlation))
        .wrap(Logger::default())
        .configure(routes::health::configure)
        .configure(routes::receipts::configure)
        .service(
            web::scope("/api/ai")
                .wrap(RequestTimeout::new(timeouts.ai))
                .configure(routes::summarize::configure),
        )
}
