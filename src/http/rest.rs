// Copyright (c) 2018 The supervisord maintainers and/or applicable contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The REST control surface. Program and supervisor mutation endpoints sit
//! behind basic auth; metrics and the log file browser do not. Blocking
//! supervisor calls are pushed onto the blocking pool so a slow stop never
//! stalls the accept loop.

use std::path::{Component, Path};

use actix_web::middleware::from_fn;
use actix_web::{web, HttpResponse};
use prometheus::{Encoder, TextEncoder};

use super::auth;
use super::AppCtx;

const BAD_REQUEST_BODY: &str = "not a valid request";

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/program")
            .wrap(from_fn(auth::require_basic_auth))
            .route("/list", web::get().to(list_programs))
            .service(
                web::resource("/start/{name}")
                    .route(web::post().to(start_program))
                    .route(web::put().to(start_program)),
            )
            .service(
                web::resource("/stop/{name}")
                    .route(web::post().to(stop_program))
                    .route(web::put().to(stop_program)),
            )
            .service(
                web::resource("/startPrograms")
                    .route(web::post().to(start_programs))
                    .route(web::put().to(start_programs)),
            )
            .service(
                web::resource("/stopPrograms")
                    .route(web::post().to(stop_programs))
                    .route(web::put().to(stop_programs)),
            )
            .route("/log/{name}/stdout", web::get().to(read_stdout_log)),
    )
    .service(
        web::scope("/supervisor")
            .wrap(from_fn(auth::require_basic_auth))
            .service(
                web::resource("/shutdown")
                    .route(web::post().to(shutdown))
                    .route(web::put().to(shutdown)),
            )
            .service(
                web::resource("/reload")
                    .route(web::post().to(reload))
                    .route(web::put().to(reload)),
            ),
    )
    .service(
        web::scope("/conf")
            .wrap(from_fn(auth::require_basic_auth))
            .route("/{program}", web::get().to(get_program_conf)),
    )
    .route("/metrics", web::get().to(metrics))
    .route("/log/{name}/{file:.*}", web::get().to(serve_log_file));
}

async fn list_programs(ctx: web::Data<AppCtx>) -> HttpResponse {
    let supervisor = ctx.supervisor.clone();
    match web::block(move || supervisor.get_all_process_info()).await {
        Ok(infos) => HttpResponse::Ok().json(infos),
        Err(_) => HttpResponse::InternalServerError().finish(),
    }
}

async fn start_program(ctx: web::Data<AppCtx>, path: web::Path<String>) -> HttpResponse {
    let name = path.into_inner();
    let supervisor = ctx.supervisor.clone();
    let result = web::block(move || supervisor.start_process(&name, true)).await;
    let success = matches!(result, Ok(Ok(true)));
    HttpResponse::Ok().json(serde_json::json!({ "success": success }))
}

async fn stop_program(ctx: web::Data<AppCtx>, path: web::Path<String>) -> HttpResponse {
    let name = path.into_inner();
    let supervisor = ctx.supervisor.clone();
    let result = web::block(move || supervisor.stop_process(&name, true)).await;
    let success = matches!(result, Ok(Ok(true)));
    HttpResponse::Ok().json(serde_json::json!({ "success": success }))
}

async fn start_programs(ctx: web::Data<AppCtx>, body: web::Bytes) -> HttpResponse {
    run_on_each(ctx, body, true).await
}

async fn stop_programs(ctx: web::Data<AppCtx>, body: web::Bytes) -> HttpResponse {
    run_on_each(ctx, body, false).await
}

/// Body is a JSON array of program names; the text reply reports aggregate
/// success.
async fn run_on_each(ctx: web::Data<AppCtx>, body: web::Bytes, starting: bool) -> HttpResponse {
    let programs: Vec<String> = match serde_json::from_slice(&body) {
        Ok(programs) => programs,
        Err(_) => return HttpResponse::BadRequest().body(BAD_REQUEST_BODY),
    };
    let supervisor = ctx.supervisor.clone();
    let total = programs.len();
    let succeeded = web::block(move || {
        programs
            .iter()
            .filter(|name| {
                let result = if starting {
                    supervisor.start_process(name, true)
                } else {
                    supervisor.stop_process(name, true)
                };
                matches!(result, Ok(true))
            })
            .count()
    })
    .await
    .unwrap_or(0);

    let verb = if starting { "start" } else { "stop" };
    if succeeded == total {
        HttpResponse::Ok().body(format!("Success to {} the programs", verb))
    } else {
        HttpResponse::Ok().body(format!("Failed to {} the programs", verb))
    }
}

/// Stub pending the log-tail extension.
async fn read_stdout_log() -> HttpResponse {
    HttpResponse::Ok().finish()
}

async fn shutdown(ctx: web::Data<AppCtx>) -> HttpResponse {
    let supervisor = ctx.supervisor.clone();
    let _ = web::block(move || supervisor.shutdown()).await;
    HttpResponse::Ok().body("Shutdown...")
}

async fn reload(ctx: web::Data<AppCtx>) -> HttpResponse {
    let supervisor = ctx.supervisor.clone();
    let result = web::block(move || supervisor.reload(false)).await;
    let success = matches!(result, Ok(Ok(_)));
    HttpResponse::Ok().json(serde_json::json!({ "success": success }))
}

async fn get_program_conf(ctx: web::Data<AppCtx>, path: web::Path<String>) -> HttpResponse {
    let name = path.into_inner();
    match ctx.supervisor.get_program_conf_file(&name) {
        Some(conf) => match std::fs::read(&conf) {
            Ok(bytes) => HttpResponse::Ok().body(bytes),
            Err(_) => HttpResponse::NotFound().finish(),
        },
        None => HttpResponse::NotFound().finish(),
    }
}

async fn metrics(ctx: web::Data<AppCtx>) -> HttpResponse {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&ctx.registry.gather(), &mut buf).is_err() {
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buf)
}

/// Static file browser rooted at the directory holding the program's
/// stdout log file.
async fn serve_log_file(
    ctx: web::Data<AppCtx>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (name, file) = path.into_inner();
    let dir = match ctx.supervisor.get_program_log_dir(&name) {
        Some(dir) => dir,
        None => return HttpResponse::NotFound().finish(),
    };
    if file.is_empty() {
        return list_directory(&dir);
    }
    let relative = Path::new(&file);
    let traversal = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if traversal {
        return HttpResponse::NotFound().finish();
    }
    match std::fs::read(dir.join(relative)) {
        Ok(bytes) => HttpResponse::Ok()
            .content_type("application/octet-stream")
            .body(bytes),
        Err(_) => HttpResponse::NotFound().finish(),
    }
}

fn list_directory(dir: &Path) -> HttpResponse {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return HttpResponse::NotFound().finish(),
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    HttpResponse::Ok()
        .content_type("text/plain")
        .body(names.join("\n"))
}
