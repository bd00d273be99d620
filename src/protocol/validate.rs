//! Request preconditions checked on both sides of the RPC boundary.

use crate::dbplugin::{
    CredentialType, DeleteUserRequest, NewUserRequest, UpdateUserRequest,
};
use crate::protocol::status::Status;

pub fn new_user(req: &NewUserRequest) -> Result<(), Status> {
    match req.credential_type {
        CredentialType::Password if req.password.is_empty() => {
            Err(Status::invalid_argument("missing password"))
        }
        CredentialType::RsaPrivateKey if req.public_key.is_empty() => {
            Err(Status::invalid_argument("missing public key"))
        }
        CredentialType::ClientCertificate if req.subject.is_empty() => {
            Err(Status::invalid_argument("missing subject"))
        }
        _ => Ok(()),
    }
}

pub fn update_user(req: &UpdateUserRequest) -> Result<(), Status> {
    if req.username.is_empty() {
        return Err(Status::invalid_argument("missing username"));
    }
    if !req.has_changes() {
        return Err(Status::invalid_argument("no changes requested"));
    }
    Ok(())
}

pub fn delete_user(req: &DeleteUserRequest) -> Result<(), Status> {
    if req.username.is_empty() {
        return Err(Status::invalid_argument("missing username"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbplugin::{ChangeExpiration, ChangePassword, ChangePublicKey, Statements};
    use crate::protocol::status::Code;
    use chrono::Utc;

    #[test]
    fn test_new_user_credential_must_match_type() {
        let mut req = NewUserRequest {
            password: "pw".to_string(),
            ..Default::default()
        };
        assert!(new_user(&req).is_ok());

        req.credential_type = CredentialType::RsaPrivateKey;
        let err = new_user(&req).unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
        assert_eq!(err.message, "missing public key");

        req.public_key = b"-----BEGIN PUBLIC KEY-----".to_vec();
        assert!(new_user(&req).is_ok());

        req.credential_type = CredentialType::ClientCertificate;
        assert_eq!(new_user(&req).unwrap_err().message, "missing subject");
    }

    #[test]
    fn test_update_user_requires_username_and_change() {
        let mut req = UpdateUserRequest::default();
        assert_eq!(update_user(&req).unwrap_err().message, "missing username");

        req.username = "u".to_string();
        assert_eq!(
            update_user(&req).unwrap_err().message,
            "no changes requested"
        );

        for change in 0..3 {
            let mut req = UpdateUserRequest {
                username: "u".to_string(),
                ..Default::default()
            };
            match change {
                0 => {
                    req.password = Some(ChangePassword {
                        new_password: "pw".to_string(),
                        statements: Statements::default(),
                    });
                }
                1 => {
                    req.public_key = Some(ChangePublicKey {
                        new_public_key: vec![1],
                        statements: Statements::default(),
                    });
                }
                _ => {
                    req.expiration = Some(ChangeExpiration {
                        new_expiration: Utc::now(),
                        statements: Statements::default(),
                    });
                }
            }
            assert!(update_user(&req).is_ok(), "change {change} should pass");
        }
    }

    #[test]
    fn test_delete_user_requires_username() {
        assert!(delete_user(&DeleteUserRequest::default()).is_err());
        assert!(delete_user(&DeleteUserRequest {
            username: "u".to_string(),
            statements: Statements::default(),
        })
        .is_ok());
    }
}
