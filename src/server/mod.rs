//! Server - HTTP read-model and action surface
//!
//! | Route | Method | Action |
//! |-------|--------|--------|
//! | `/health` | GET | liveness |
//! | `/state` | GET | combined snapshot |
//! | `/networks` | GET | network registry |
//! | `/wallet/connect` | POST | `{kind?}` → session |
//! | `/wallet/disconnect` | POST | cascade disconnect |
//! | `/wallet/network` | POST | `{chainId}` → wallet state |
//! | `/wallet/balance` | POST | refresh → wallet state |
//! | `/wallet/sign` | POST | `{message}` → `{signature}` |
//! | `/wallet/transaction` | POST | tx → `{hash}` |
//! | `/conversations` | GET | conversation list |
//! | `/messages` | POST | `{peer, body}` → message |
//! | `/messages/:peer` | GET | `?limit=` → messages |
//! | `/reachable/:identity` | GET | `{identity, reachable}` |
//! | `/error/clear` | POST | clear errors → snapshot |

mod routes;

pub use routes::{create_router, create_router_with_name, status_for, ApiError, AppState};
