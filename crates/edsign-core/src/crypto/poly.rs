//! Secret and public polynomials for threshold sharing.
//!
//! A participant with index `i` always evaluates at `x = i + 1`, so the
//! shared secret sits at `x = 0` and is never a participant share.

use curve25519_dalek::{traits::Identity, EdwardsPoint, Scalar};
use rand::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A secret polynomial of degree `t - 1`; the constant term is the dealt
/// secret.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretPolynomial {
    coeffs: Vec<Scalar>,
}

impl SecretPolynomial {
    /// Sample a fresh random polynomial for threshold `t`.
    pub fn random<R: RngCore + CryptoRng>(threshold: usize, rng: &mut R) -> Self {
        let coeffs = (0..threshold).map(|_| Scalar::random(rng)).collect();
        SecretPolynomial { coeffs }
    }

    /// The dealt secret, `f(0)`.
    pub fn secret(&self) -> &Scalar {
        &self.coeffs[0]
    }

    /// Evaluate the share for participant `index`.
    pub fn evaluate(&self, index: u32) -> Scalar {
        let x = Scalar::from(index as u64 + 1);
        self.coeffs
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, c| acc * x + c)
    }

    /// Commit every coefficient to the base point.
    pub fn commitment(&self) -> PublicPolynomial {
        PublicPolynomial {
            commits: self.coeffs.iter().map(EdwardsPoint::mul_base).collect(),
        }
    }
}

/// The public image of a secret polynomial: per-coefficient commitments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicPolynomial {
    commits: Vec<EdwardsPoint>,
}

impl PublicPolynomial {
    pub fn new(commits: Vec<EdwardsPoint>) -> Self {
        PublicPolynomial { commits }
    }

    /// The all-identity polynomial: the additive zero, also standing in
    /// until a dealer justifies an undecodable deal.
    pub fn placeholder(threshold: usize) -> Self {
        PublicPolynomial {
            commits: vec![EdwardsPoint::identity(); threshold],
        }
    }

    /// The committed secret, `f(0)·G`.
    pub fn public(&self) -> &EdwardsPoint {
        &self.commits[0]
    }

    pub fn threshold(&self) -> usize {
        self.commits.len()
    }

    /// The public share of participant `index`, `f(index + 1)·G`.
    pub fn evaluate(&self, index: u32) -> EdwardsPoint {
        let x = Scalar::from(index as u64 + 1);
        self.commits
            .iter()
            .rev()
            .fold(EdwardsPoint::identity(), |acc, c| acc * x + c)
    }

    /// Pointwise sum with another polynomial of the same degree.
    pub fn add_assign(&mut self, other: &PublicPolynomial) {
        for (a, b) in self.commits.iter_mut().zip(&other.commits) {
            *a += b;
        }
    }

    pub fn points(&self) -> &[EdwardsPoint] {
        &self.commits
    }

    pub fn into_points(self) -> Vec<EdwardsPoint> {
        self.commits
    }
}

/// Lagrange basis `λ_i(0)` for the participant set `indices`.
pub fn lagrange_basis(indices: &[u32], i: u32) -> Scalar {
    let xi = Scalar::from(i as u64 + 1);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for &j in indices {
        if j == i {
            continue;
        }
        let xj = Scalar::from(j as u64 + 1);
        numerator *= xj;
        denominator *= xj - xi;
    }
    numerator * denominator.invert()
}

/// Interpolate the secret at `x = 0` from indexed shares.
pub fn recover_secret(shares: &[(u32, Scalar)]) -> Scalar {
    let indices: Vec<u32> = shares.iter().map(|(i, _)| *i).collect();
    shares
        .iter()
        .map(|(i, s)| lagrange_basis(&indices, *i) * s)
        .sum()
}
