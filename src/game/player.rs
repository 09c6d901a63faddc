//! Player records replicated alongside tracked entities

use crate::game::entity::PeerId;
use crate::game::scene::Domain;
use crate::net::codec::{CodecError, Packet};
use crate::util::{Quat, Vec3};

/// Hitbox regions of a player body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPart {
    Head = 0,
    Torso = 1,
    LeftHand = 2,
    RightHand = 3,
}

impl BodyPart {
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(BodyPart::Head),
            1 => Ok(BodyPart::Torso),
            2 => Ok(BodyPart::LeftHand),
            3 => Ok(BodyPart::RightHand),
            tag => Err(CodecError::InvalidTag {
                what: "body part",
                tag,
            }),
        }
    }
}

/// Pose and vitals sent every tick on the unreliable channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerTransform {
    pub position: Vec3,
    pub rotation: Quat,
    pub head_position: Vec3,
    pub head_rotation: Quat,
    pub torso_position: Vec3,
    pub torso_rotation: Quat,
    pub left_hand_position: Vec3,
    pub left_hand_rotation: Quat,
    pub right_hand_position: Vec3,
    pub right_hand_rotation: Quat,
    pub health: f32,
    pub max_health: i32,
}

impl PlayerTransform {
    pub fn write(&self, p: &mut Packet) {
        p.write_vec3(self.position);
        p.write_quat(self.rotation);
        p.write_vec3(self.head_position);
        p.write_quat(self.head_rotation);
        p.write_vec3(self.torso_position);
        p.write_quat(self.torso_rotation);
        p.write_vec3(self.left_hand_position);
        p.write_quat(self.left_hand_rotation);
        p.write_vec3(self.right_hand_position);
        p.write_quat(self.right_hand_rotation);
        p.write_f32(self.health);
        p.write_i32(self.max_health);
    }

    pub fn read(p: &mut Packet) -> Result<Self, CodecError> {
        Ok(Self {
            position: p.read_vec3()?,
            rotation: p.read_quat()?,
            head_position: p.read_vec3()?,
            head_rotation: p.read_quat()?,
            torso_position: p.read_vec3()?,
            torso_rotation: p.read_quat()?,
            left_hand_position: p.read_vec3()?,
            left_hand_rotation: p.read_quat()?,
            right_hand_position: p.read_vec3()?,
            right_hand_rotation: p.read_quat()?,
            health: p.read_f32()?,
            max_health: p.read_i32()?,
        })
    }
}

/// A connected participant
#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub id: PeerId,
    pub username: String,
    /// Faction tag
    pub iff: i32,
    pub transform: PlayerTransform,
    pub domain: Domain,
}

impl Player {
    pub fn new(id: PeerId, username: impl Into<String>, domain: Domain) -> Self {
        Self {
            id,
            username: username.into(),
            iff: 0,
            transform: PlayerTransform::default(),
            domain,
        }
    }

    /// Body of a `SpawnPlayer` message
    pub fn write_spawn(&self, p: &mut Packet) {
        p.write_i32(self.id);
        p.write_str(&self.username);
        p.write_i32(self.iff);
        self.domain.write(p);
        self.transform.write(p);
    }

    pub fn read_spawn(p: &mut Packet) -> Result<Self, CodecError> {
        let id = p.read_i32()?;
        let username = p.read_string()?;
        let iff = p.read_i32()?;
        let domain = Domain::read(p)?;
        let transform = PlayerTransform::read(p)?;
        Ok(Self {
            id,
            username,
            iff,
            transform,
            domain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_round_trip() {
        let mut player = Player::new(3, "rook", Domain::new("Village", 1));
        player.iff = 2;
        player.transform.position = Vec3::new(4.0, 0.0, -1.0);
        player.transform.health = 80.0;
        player.transform.max_health = 100;

        let mut p = Packet::new();
        player.write_spawn(&mut p);
        let mut r = Packet::from_bytes(p.into_bytes());
        assert_eq!(Player::read_spawn(&mut r).unwrap(), player);
    }

    #[test]
    fn test_body_part_tags() {
        assert_eq!(BodyPart::from_u8(3).unwrap(), BodyPart::RightHand);
        assert!(BodyPart::from_u8(4).is_err());
    }
}
