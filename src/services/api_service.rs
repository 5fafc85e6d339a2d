use actix_web::{middleware::Logger, web, App, HttpResponse, HttpServer, Result as ActixResult, Scope};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::modbus::{ModbusSession, ReadRequest, WriteCoilRequest, WriteRegisterRequest};
use crate::utils::error::ModbusError;

// Request payloads arrive as loose JSON integers; range validation happens
// here before any typed request reaches the session.

#[derive(Debug, Deserialize)]
pub struct ConnectPayload {
    pub ip: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReadPayload {
    pub start_address: Option<i64>,
    pub count: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct WritePayload {
    pub address: Option<i64>,
    pub value: Option<i64>,
}

/// Shared handler state. The mutex serializes every operation against the
/// single session (one Modbus request in flight per connection); the `Option`
/// realizes create-on-connect / destroy-on-disconnect.
#[derive(Clone)]
pub struct ApiServiceState {
    pub session: Arc<Mutex<Option<ModbusSession>>>,
    pub config: Config,
}

impl ApiServiceState {
    pub fn new(config: Config) -> Self {
        Self {
            session: Arc::new(Mutex::new(None)),
            config,
        }
    }
}

// API Service
pub struct ApiService {
    state: ApiServiceState,
    server_handle: Option<actix_web::dev::ServerHandle>,
}

impl ApiService {
    pub fn new(config: Config) -> Self {
        Self {
            state: ApiServiceState::new(config),
            server_handle: None,
        }
    }

    pub async fn start(&mut self) -> Result<(), ModbusError> {
        let host = self.state.config.server.host.clone();
        let port = self.state.config.server.port;
        info!("🌐 Starting HTTP API server on {}:{}", host, port);

        let state_data = web::Data::new(self.state.clone());

        let server = HttpServer::new(move || {
            App::new()
                .app_data(state_data.clone())
                .wrap(Logger::default())
                .service(api_scope())
        })
        .bind((host.as_str(), port))
        .map_err(|e| {
            ModbusError::Connection(format!("failed to bind {}:{}: {}", host, port, e))
        })?
        .run();

        // Store server handle for graceful shutdown
        self.server_handle = Some(server.handle());

        tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("❌ HTTP API server error: {}", e);
            }
        });

        info!("✅ HTTP API server started successfully on port {}", port);
        Ok(())
    }

    pub async fn stop(&mut self) {
        info!("🛑 Stopping HTTP API server...");

        if let Some(handle) = self.server_handle.take() {
            tokio::select! {
                _ = handle.stop(true) => {
                    info!("✅ HTTP API server stopped gracefully");
                }
                _ = tokio::time::sleep(tokio::time::Duration::from_secs(10)) => {
                    warn!("⚠️  HTTP API server shutdown timeout, forcing stop");
                    handle.stop(false).await;
                }
            }
        }

        // Release the device connection on shutdown
        let mut guard = self.state.session.lock().await;
        if let Some(session) = guard.as_mut() {
            session.disconnect();
        }
        *guard = None;
    }
}

fn api_scope() -> Scope {
    web::scope("/api")
        .route("/health", web::get().to(health_check))
        .route("/connect", web::post().to(connect_device))
        .route("/disconnect", web::post().to(disconnect_device))
        .route("/read_registers", web::post().to(read_registers))
        .route("/write_register", web::post().to(write_register))
        .route("/write_coil", web::post().to(write_coil))
        .route("/read_coils", web::post().to(read_coils))
        .route("/status", web::get().to(get_status))
}

// API Endpoints

// POST /api/connect - Create a session and connect to the device
async fn connect_device(
    payload: web::Json<ConnectPayload>,
    state: web::Data<ApiServiceState>,
) -> ActixResult<HttpResponse> {
    let ip = match payload.ip.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(ip) => ip.to_string(),
        None => {
            return Ok(HttpResponse::BadRequest().json(json!({
                "status": "disconnected",
                "error": "Device IP address is required"
            })))
        }
    };

    let mut guard = state.session.lock().await;

    // Release the previous device connection before replacing the session
    if let Some(old) = guard.as_mut() {
        old.disconnect();
    }

    let mut session = ModbusSession::from_settings(ip.clone(), &state.config.modbus);
    let result = session.connect().await;
    let info = session.connection_info();
    *guard = Some(session);

    match result {
        Ok(()) => Ok(HttpResponse::Ok().json(json!({
            "status": "connected",
            "clp_ip": ip,
            "unit_id": info.unit_id,
            "timeout": info.timeout
        }))),
        Err(e) => {
            error!("❌ Connect request failed: {}", e);
            Ok(HttpResponse::InternalServerError().json(json!({
                "status": "disconnected",
                "error": e.to_string()
            })))
        }
    }
}

// POST /api/disconnect - Idempotent teardown of the session
async fn disconnect_device(state: web::Data<ApiServiceState>) -> ActixResult<HttpResponse> {
    let mut guard = state.session.lock().await;
    if let Some(session) = guard.as_mut() {
        session.disconnect();
    }
    *guard = None;

    Ok(HttpResponse::Ok().json(json!({ "status": "disconnected" })))
}

// POST /api/read_registers - Read holding registers
async fn read_registers(
    payload: web::Json<ReadPayload>,
    state: web::Data<ApiServiceState>,
) -> ActixResult<HttpResponse> {
    let mut guard = state.session.lock().await;
    let session = match guard.as_mut() {
        Some(session) => session,
        None => {
            return Ok(HttpResponse::BadRequest().json(json!({
                "success": false,
                "error": "Device not connected"
            })))
        }
    };

    let request = match parse_read_request(
        payload.start_address.unwrap_or(0),
        payload.count.unwrap_or(10),
    ) {
        Ok(request) => request,
        Err(e) => {
            warn!("❌ Register read validation failed: {}", e);
            return Ok(HttpResponse::BadRequest().json(json!({
                "success": false,
                "error": e.to_string()
            })));
        }
    };

    match session.read_holding_registers(request).await {
        Ok(registers) => {
            let count = registers.len();
            Ok(HttpResponse::Ok().json(json!({
                "success": true,
                "registers": registers,
                "start_address": request.start_address,
                "count": count,
                "unit_id": session.connection_info().unit_id
            })))
        }
        Err(e) => {
            error!("❌ Register read failed: {}", e);
            Ok(failure_response(&e).json(json!({
                "success": false,
                "error": e.to_string()
            })))
        }
    }
}

// POST /api/write_register - Write a single holding register
async fn write_register(
    payload: web::Json<WritePayload>,
    state: web::Data<ApiServiceState>,
) -> ActixResult<HttpResponse> {
    let mut guard = state.session.lock().await;
    let session = match guard.as_mut() {
        Some(session) => session,
        None => {
            return Ok(HttpResponse::BadRequest().json(json!({
                "success": false,
                "error": "Device not connected"
            })))
        }
    };

    let (address, value) = match (payload.address, payload.value) {
        (Some(address), Some(value)) => (address, value),
        _ => {
            return Ok(HttpResponse::BadRequest().json(json!({
                "success": false,
                "error": "Address and value are required"
            })))
        }
    };

    let request = match parse_write_register_request(address, value) {
        Ok(request) => request,
        Err(e) => {
            warn!("❌ Register write validation failed: {}", e);
            return Ok(HttpResponse::BadRequest().json(json!({
                "success": false,
                "error": e.to_string()
            })));
        }
    };

    match session.write_single_register(request).await {
        Ok(()) => Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "address": request.address,
            "value": request.value,
            "unit_id": session.connection_info().unit_id
        }))),
        Err(e) => {
            error!("❌ Register write failed: {}", e);
            Ok(failure_response(&e).json(json!({
                "success": false,
                "error": e.to_string()
            })))
        }
    }
}

// POST /api/write_coil - Write a single coil
async fn write_coil(
    payload: web::Json<WritePayload>,
    state: web::Data<ApiServiceState>,
) -> ActixResult<HttpResponse> {
    let mut guard = state.session.lock().await;
    let session = match guard.as_mut().filter(|s| s.is_connected()) {
        Some(session) => session,
        None => {
            return Ok(HttpResponse::BadRequest().json(json!({
                "status": "error",
                "message": "Not connected to Modbus device"
            })))
        }
    };

    let (address, value) = match (payload.address, payload.value) {
        (Some(address), Some(value)) => (address, value),
        _ => {
            return Ok(HttpResponse::BadRequest().json(json!({
                "status": "error",
                "message": "Invalid parameters. Required: address, value"
            })))
        }
    };

    let request = match parse_write_coil_request(address, value) {
        Ok(request) => request,
        Err(e) => {
            warn!("❌ Coil write validation failed: {}", e);
            return Ok(HttpResponse::BadRequest().json(json!({
                "status": "error",
                "message": e.to_string()
            })));
        }
    };

    match session.write_single_coil(request).await {
        Ok(()) => Ok(HttpResponse::Ok().json(json!({
            "status": "success",
            "message": format!("Value {} written to coil {}", value, request.address)
        }))),
        Err(e) => {
            error!("❌ Coil write failed: {}", e);
            Ok(failure_response(&e).json(json!({
                "status": "error",
                "message": e.to_string()
            })))
        }
    }
}

// POST /api/read_coils - Read coils
async fn read_coils(
    payload: web::Json<ReadPayload>,
    state: web::Data<ApiServiceState>,
) -> ActixResult<HttpResponse> {
    let mut guard = state.session.lock().await;
    let session = match guard.as_mut().filter(|s| s.is_connected()) {
        Some(session) => session,
        None => {
            return Ok(HttpResponse::BadRequest().json(json!({
                "status": "error",
                "message": "Not connected to Modbus device"
            })))
        }
    };

    let (start_address, count) = match (payload.start_address, payload.count) {
        (Some(start_address), Some(count)) => (start_address, count),
        _ => {
            return Ok(HttpResponse::BadRequest().json(json!({
                "status": "error",
                "message": "Invalid parameters. Required: start_address, count"
            })))
        }
    };

    let request = match parse_read_request(start_address, count) {
        Ok(request) => request,
        Err(e) => {
            warn!("❌ Coil read validation failed: {}", e);
            return Ok(HttpResponse::BadRequest().json(json!({
                "status": "error",
                "message": e.to_string()
            })));
        }
    };

    match session.read_coils(request).await {
        Ok(coils) => {
            let bits: Vec<u8> = coils.iter().map(|&b| b as u8).collect();
            Ok(HttpResponse::Ok().json(json!({
                "status": "success",
                "coils": bits,
                "message": format!(
                    "Read {} coils starting at address {}",
                    request.count, request.start_address
                )
            })))
        }
        Err(e) => {
            error!("❌ Coil read failed: {}", e);
            Ok(failure_response(&e).json(json!({
                "status": "error",
                "message": e.to_string()
            })))
        }
    }
}

// GET /api/status - Live connection status
async fn get_status(state: web::Data<ApiServiceState>) -> ActixResult<HttpResponse> {
    let guard = state.session.lock().await;

    match guard.as_ref() {
        Some(session) if session.is_connected() => {
            let info = session.connection_info();
            Ok(HttpResponse::Ok().json(json!({
                "status": "connected",
                "ip": info.ip,
                "port": info.port,
                "unit_id": info.unit_id,
                "timeout": info.timeout
            })))
        }
        _ => Ok(HttpResponse::Ok().json(json!({ "status": "disconnected" }))),
    }
}

// GET /api/health - Health check
async fn health_check() -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "Modbus TCP Manager",
        "version": crate::VERSION
    })))
}

fn failure_response(error: &ModbusError) -> actix_web::HttpResponseBuilder {
    match error {
        ModbusError::Validation(_) => HttpResponse::BadRequest(),
        _ => HttpResponse::InternalServerError(),
    }
}

fn parse_read_request(start_address: i64, count: i64) -> Result<ReadRequest, ModbusError> {
    Ok(ReadRequest {
        start_address: parse_address(start_address, "start_address")?,
        count: parse_count(count)?,
    })
}

fn parse_write_register_request(address: i64, value: i64) -> Result<WriteRegisterRequest, ModbusError> {
    if !(0..=65535).contains(&value) {
        return Err(ModbusError::Validation(
            "value must be an integer between 0 and 65535".to_string(),
        ));
    }

    Ok(WriteRegisterRequest {
        address: parse_address(address, "address")?,
        value: value as u16,
    })
}

fn parse_write_coil_request(address: i64, value: i64) -> Result<WriteCoilRequest, ModbusError> {
    if value != 0 && value != 1 {
        return Err(ModbusError::Validation("value must be 0 or 1".to_string()));
    }

    Ok(WriteCoilRequest {
        address: parse_address(address, "address")?,
        value: value == 1,
    })
}

fn parse_address(value: i64, field: &str) -> Result<u16, ModbusError> {
    if !(0..=65535).contains(&value) {
        return Err(ModbusError::Validation(format!(
            "{} must be between 0 and 65535",
            field
        )));
    }
    Ok(value as u16)
}

fn parse_count(value: i64) -> Result<u16, ModbusError> {
    if !(1..=125).contains(&value) {
        return Err(ModbusError::Validation(
            "count must be between 1 and 125".to_string(),
        ));
    }
    Ok(value as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test;

    fn test_state() -> web::Data<ApiServiceState> {
        web::Data::new(ApiServiceState::new(Config::default()))
    }

    #[actix_web::test]
    async fn test_status_reports_disconnected_without_session() {
        let app = test::init_service(
            App::new().app_data(test_state()).service(api_scope()),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/status").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "disconnected");
    }

    #[actix_web::test]
    async fn test_health_check() {
        let app = test::init_service(
            App::new().app_data(test_state()).service(api_scope()),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], crate::VERSION);
    }

    #[actix_web::test]
    async fn test_connect_requires_ip() {
        let app = test::init_service(
            App::new().app_data(test_state()).service(api_scope()),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/connect")
            .set_json(json!({}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_read_registers_requires_connection() {
        let app = test::init_service(
            App::new().app_data(test_state()).service(api_scope()),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/read_registers")
            .set_json(json!({ "start_address": 0, "count": 4 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_write_coil_requires_connection() {
        let app = test::init_service(
            App::new().app_data(test_state()).service(api_scope()),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/write_coil")
            .set_json(json!({ "address": 3, "value": 1 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "error");
    }

    #[actix_web::test]
    async fn test_disconnect_is_idempotent_over_http() {
        let app = test::init_service(
            App::new().app_data(test_state()).service(api_scope()),
        )
        .await;

        for _ in 0..2 {
            let req = test::TestRequest::post().uri("/api/disconnect").to_request();
            let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
            assert_eq!(body["status"], "disconnected");
        }
    }

    #[::core::prelude::v1::test]
    fn test_payload_validation_rules() {
        assert!(matches!(
            parse_count(0),
            Err(ModbusError::Validation(_))
        ));
        assert!(matches!(
            parse_count(126),
            Err(ModbusError::Validation(_))
        ));
        assert_eq!(parse_count(125).unwrap(), 125);

        assert!(matches!(
            parse_write_register_request(0, 65536),
            Err(ModbusError::Validation(_))
        ));
        assert!(matches!(
            parse_write_register_request(-1, 0),
            Err(ModbusError::Validation(_))
        ));

        assert!(matches!(
            parse_write_coil_request(3, 2),
            Err(ModbusError::Validation(_))
        ));
        assert!(parse_write_coil_request(3, 1).unwrap().value);
        assert!(!parse_write_coil_request(3, 0).unwrap().value);
    }
}
