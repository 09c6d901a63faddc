//! Damage record shared by player and entity damage packets

use crate::net::codec::{CodecError, Packet};
use crate::util::Vec3;

/// One damage application, forwarded to whichever peer simulates the target
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Damage {
    pub point: Vec3,
    pub source_iff: i32,
    pub source_point: Vec3,
    pub blunt: f32,
    pub piercing: f32,
    pub cutting: f32,
    pub total_kinetic: f32,
    pub thermal: f32,
    pub chilling: f32,
    pub emp: f32,
    pub total_energetic: f32,
    pub stunning: f32,
    pub blinding: f32,
    pub hit_normal: Vec3,
    pub strike_dir: Vec3,
    pub edge_normal: Vec3,
    pub damage_size: f32,
    pub class: u8,
}

impl Damage {
    pub fn write(&self, p: &mut Packet) {
        p.write_vec3(self.point);
        p.write_i32(self.source_iff);
        p.write_vec3(self.source_point);
        for value in [
            self.blunt,
            self.piercing,
            self.cutting,
            self.total_kinetic,
            self.thermal,
            self.chilling,
            self.emp,
            self.total_energetic,
            self.stunning,
            self.blinding,
        ] {
            p.write_f32(value);
        }
        p.write_vec3(self.hit_normal);
        p.write_vec3(self.strike_dir);
        p.write_vec3(self.edge_normal);
        p.write_f32(self.damage_size);
        p.write_u8(self.class);
    }

    pub fn read(p: &mut Packet) -> Result<Self, CodecError> {
        Ok(Self {
            point: p.read_vec3()?,
            source_iff: p.read_i32()?,
            source_point: p.read_vec3()?,
            blunt: p.read_f32()?,
            piercing: p.read_f32()?,
            cutting: p.read_f32()?,
            total_kinetic: p.read_f32()?,
            thermal: p.read_f32()?,
            chilling: p.read_f32()?,
            emp: p.read_f32()?,
            total_energetic: p.read_f32()?,
            stunning: p.read_f32()?,
            blinding: p.read_f32()?,
            hit_normal: p.read_vec3()?,
            strike_dir: p.read_vec3()?,
            edge_normal: p.read_vec3()?,
            damage_size: p.read_f32()?,
            class: p.read_u8()?,
        })
    }

    /// Sum of kinetic and energetic components
    pub fn total(&self) -> f32 {
        self.total_kinetic + self.total_energetic
    }
}
