//! JWT 认证模块
//!
//! WebSocket 握手前校验会话 token，解析出用户 ID

use axum::http::HeaderMap;
use config::JwtConfig;
use domain::UserId;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// JWT Token 服务
#[derive(Clone)]
pub struct JwtService {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_ref());
        let decoding_key = DecodingKey::from_secret(config.secret.as_ref());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// 生成 JWT token
    pub fn generate_token(&self, user_id: UserId) -> Result<String, ApiError> {
        let now = chrono::Utc::now();
        let exp = now + chrono::Duration::hours(self.config.expiration_hours);

        let claims = Claims {
            user_id: user_id.into(),
            exp: exp.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| ApiError::internal_server_error(format!("Token generation failed: {}", err)))
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|token_data| token_data.claims)
            .map_err(|err| ApiError::unauthorized(format!("Invalid token: {}", err)))
    }

    /// 优先使用查询参数中的 token，否则读取 `Authorization: Bearer` 头
    pub fn authenticate(&self, token: Option<&str>, headers: &HeaderMap) -> Result<UserId, ApiError> {
        let token = match token {
            Some(token) => token,
            None => headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|header| header.to_str().ok())
                .ok_or_else(|| ApiError::unauthorized("Missing authorization header"))?
                .strip_prefix("Bearer ")
                .ok_or_else(|| ApiError::unauthorized("Invalid authorization header format"))?,
        };

        let claims = self.verify_token(token)?;
        Ok(UserId::from(claims.user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header::AUTHORIZATION, HeaderValue, StatusCode};

    fn service() -> JwtService {
        JwtService::new(JwtConfig {
            secret: "test-secret-key-that-is-long-enough".to_string(),
            expiration_hours: 1,
        })
    }

    #[test]
    fn token_round_trip_yields_user() {
        let jwt = service();
        let user = UserId::random();
        let token = jwt.generate_token(user).unwrap();

        assert_eq!(jwt.authenticate(Some(&token), &HeaderMap::new()).unwrap(), user);

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        assert_eq!(jwt.authenticate(None, &headers).unwrap(), user);
    }

    #[test]
    fn missing_or_foreign_token_is_rejected() {
        let jwt = service();
        let err = jwt.authenticate(None, &HeaderMap::new()).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        let other = JwtService::new(JwtConfig {
            secret: "another-secret-key-that-is-long-enough".to_string(),
            expiration_hours: 1,
        });
        let token = other.generate_token(UserId::random()).unwrap();
        assert!(jwt.authenticate(Some(&token), &HeaderMap::new()).is_err());
    }
}
