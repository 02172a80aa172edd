use crate::engine::EngineHandle;
use crate::error::{ApiError, Endpoint};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, Method};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

#[derive(Debug, Deserialize)]
struct EnrollRequest {
    usn: Option<String>,
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecognizeRequest {
    image: Option<String>,
}

/// The full HTTP application: endpoints plus CORS, tracing and body limits.
pub fn app(engine: EngineHandle, max_body_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .allow_origin(Any);

    routes(engine)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

pub fn routes(engine: EngineHandle) -> Router {
    Router::new()
        .route("/enroll", post(handler_enroll))
        .route("/recognize", post(handler_recognize))
        .route("/status", get(handler_status))
        .route("/students", get(handler_list))
        .route("/students/:usn", delete(handler_remove))
        .with_state(engine)
}

/// Treat absent, null and empty strings alike.
fn present(field: Option<String>) -> Option<String> {
    field.filter(|s| !s.is_empty())
}

async fn handler_enroll(
    State(engine): State<EngineHandle>,
    payload: Result<Json<EnrollRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Ok(Json(req)) = payload else {
        return Err(ApiError::missing_field(Endpoint::Enroll));
    };
    let (Some(usn), Some(image)) = (present(req.usn), present(req.image)) else {
        return Err(ApiError::missing_field(Endpoint::Enroll));
    };

    tracing::info!(usn = %usn, "enroll requested");
    let result = engine
        .enroll(usn, image)
        .await
        .map_err(|e| ApiError::engine(Endpoint::Enroll, e))?;
    tracing::info!(usn = %result.usn, faces = result.saved.len(), "student enrolled");

    Ok(Json(json!({
        "message": format!("Student {} enrolled successfully!", result.usn),
    })))
}

async fn handler_recognize(
    State(engine): State<EngineHandle>,
    payload: Result<Json<RecognizeRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Some(image) = payload.ok().and_then(|Json(req)| present(req.image)) else {
        return Err(ApiError::missing_field(Endpoint::Recognize));
    };

    tracing::info!("recognize requested");
    let prediction = engine
        .recognize(image)
        .await
        .map_err(|e| ApiError::engine(Endpoint::Recognize, e))?;

    Ok(Json(json!({
        "usn": prediction.usn,
        "confidence": prediction.confidence(),
    })))
}

async fn handler_status(State(engine): State<EngineHandle>) -> Result<Json<Value>, ApiError> {
    let status = engine
        .status()
        .await
        .map_err(|e| ApiError::engine(Endpoint::Students, e))?;
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "faces_dir": status.faces_dir.display().to_string(),
        "identities": status.identities,
        "faces": status.faces,
    })))
}

async fn handler_list(State(engine): State<EngineHandle>) -> Result<Json<Value>, ApiError> {
    let students = engine
        .list()
        .await
        .map_err(|e| ApiError::engine(Endpoint::Students, e))?;
    Ok(Json(json!(students)))
}

async fn handler_remove(
    State(engine): State<EngineHandle>,
    Path(usn): Path<String>,
) -> Result<Json<Value>, ApiError> {
    tracing::info!(usn = %usn, "remove requested");
    let removed = engine
        .remove(usn.clone())
        .await
        .map_err(|e| ApiError::engine(Endpoint::Students, e))?;
    if !removed {
        return Err(ApiError::not_found(&usn));
    }
    Ok(Json(json!({ "message": format!("Student {usn} removed") })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{data_url, face_image, one_face, StubDetector};
    use crate::engine::{spawn_engine, Engine};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use rollcall_core::{FaceStore, LbphParams};
    use tower::ServiceExt;

    fn test_app(detector: StubDetector, root: &std::path::Path) -> Router {
        let engine = Engine::new(
            Box::new(detector),
            FaceStore::open(root).unwrap(),
            LbphParams::default(),
        );
        app(spawn_engine(engine).unwrap(), 1024 * 1024)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let res = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_enroll_then_recognize() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(one_face(), tmp.path());
        let image = data_url(&face_image(1));

        let (status, body) = send(
            &app,
            Method::POST,
            "/enroll",
            Some(json!({ "usn": "1AB20CS001", "image": image })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "message": "Student 1AB20CS001 enrolled successfully!" }));
        assert!(tmp.path().join("1AB20CS001/1AB20CS001_1.jpg").is_file());

        let (status, body) = send(&app, Method::POST, "/recognize", Some(json!({ "image": image }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["usn"], "1AB20CS001");
        assert!(body["confidence"].as_i64().unwrap() >= 0);
    }

    #[tokio::test]
    async fn test_enroll_missing_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(one_face(), tmp.path());
        let expected = json!({ "message": "USN or image data is missing" });

        for body in [
            json!({ "image": "data:," }),
            json!({ "usn": "abc" }),
            json!({ "usn": "", "image": "data:," }),
            json!({ "usn": null, "image": "data:," }),
        ] {
            let (status, reply) = send(&app, Method::POST, "/enroll", Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(reply, expected);
        }

        let res = app
            .clone()
            .oneshot(
                Request::post("/enroll")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_enroll_rejections() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(one_face(), tmp.path());

        let (status, body) = send(
            &app,
            Method::POST,
            "/enroll",
            Some(json!({ "usn": "../etc", "image": data_url(&face_image(1)) })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "message": "Invalid USN" }));

        let (status, body) = send(
            &app,
            Method::POST,
            "/enroll",
            Some(json!({ "usn": "abc", "image": "data:image/jpeg;base64,bm90IGFuIGltYWdl" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "message": "Invalid image format" }));

        let blank = image::GrayImage::new(16, 16);
        let (status, body) = send(
            &app,
            Method::POST,
            "/enroll",
            Some(json!({ "usn": "abc", "image": data_url(&blank) })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "message": "No face detected" }));

        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_recognize_rejections() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(one_face(), tmp.path());

        let (status, body) = send(&app, Method::POST, "/recognize", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "usn": "No image data" }));

        let (status, body) = send(&app, Method::POST, "/recognize", Some(json!({ "image": "nocomma" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "usn": "Invalid image format" }));

        let image = data_url(&face_image(1));
        let (status, body) = send(&app, Method::POST, "/recognize", Some(json!({ "image": image }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "usn": "No enrolled students yet" }));

        send(&app, Method::POST, "/enroll", Some(json!({ "usn": "abc", "image": image }))).await;
        let blank = data_url(&image::GrayImage::new(16, 16));
        let (status, body) = send(&app, Method::POST, "/recognize", Some(json!({ "image": blank }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "usn": "No face detected" }));
    }

    #[tokio::test]
    async fn test_second_enroll_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(one_face(), tmp.path());
        for seed in [1, 2] {
            let body = json!({ "usn": "abc", "image": data_url(&face_image(seed)) });
            let (status, _) = send(&app, Method::POST, "/enroll", Some(body)).await;
            assert_eq!(status, StatusCode::OK);
        }
        assert!(tmp.path().join("abc/abc_1.jpg").is_file());
        assert!(tmp.path().join("abc/abc_2.jpg").is_file());
    }

    #[tokio::test]
    async fn test_students_list_and_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(one_face(), tmp.path());
        for usn in ["zeta", "alpha"] {
            let body = json!({ "usn": usn, "image": data_url(&face_image(3)) });
            send(&app, Method::POST, "/enroll", Some(body)).await;
        }

        let (status, body) = send(&app, Method::GET, "/students", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!([{ "usn": "alpha", "faces": 1 }, { "usn": "zeta", "faces": 1 }])
        );

        let (status, body) = send(&app, Method::GET, "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!((body["identities"].as_u64(), body["faces"].as_u64()), (Some(2), Some(2)));

        let (status, body) = send(&app, Method::DELETE, "/students/zeta", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "message": "Student zeta removed" }));

        let (status, body) = send(&app, Method::DELETE, "/students/zeta", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "message": "Student zeta not found" }));

        let (status, _) = send(&app, Method::DELETE, "/students/bad.name", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(one_face(), tmp.path());
        let res = app
            .oneshot(
                Request::get("/students")
                    .header(header::ORIGIN, "http://example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            res.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
    }
}
